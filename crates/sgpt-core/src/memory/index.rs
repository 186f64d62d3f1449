//! ============================================================================
//! Memory Index - Chunk, embed and store memorized documents
//! ============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::embeddings::Embedder;
use super::store::VectorIndex;
use super::types::{IndexPoint, MemorizeRequest, MemoryError};
use super::collection_name;
use crate::chunker::chunk_text;
use crate::types::MemoryRecord;

/// Writes and deletes a user's memorized documents in the vector backend
pub struct MemoryIndex {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorIndex>,
}

/// Return `requested` unless it is taken, else insert `_<uuid>` between the
/// file stem and the extension.
pub fn resolve_memory_id(requested: &str, taken: &HashSet<String>) -> String {
    let mut candidate = requested.to_string();
    while taken.contains(&candidate) {
        let token = Uuid::new_v4().simple().to_string();
        candidate = match requested.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}_{}.{}", stem, token, ext),
            _ => format!("{}_{}", requested, token),
        };
    }
    candidate
}

impl MemoryIndex {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, store }
    }

    /// Index a document paragraph by paragraph. Chunks stored before a
    /// failure stay in the collection and are reported in `Partial`.
    pub async fn memorize(&self, request: MemorizeRequest<'_>) -> Result<MemoryRecord, MemoryError> {
        if request.memory_id.trim().is_empty() {
            return Err(MemoryError::EmptyMemoryId);
        }
        if request.text.trim().is_empty() {
            return Err(MemoryError::EmptyText);
        }

        let memory_id = resolve_memory_id(request.memory_id.trim(), request.taken);
        if memory_id != request.memory_id.trim() {
            info!(
                "Memory id '{}' already used by user {}, storing as '{}'",
                request.memory_id, request.user_id, memory_id
            );
        }

        let paragraphs = chunk_text(request.text, &request.chunking);
        let collection = collection_name(request.user_id);
        let mut stored: Vec<String> = Vec::with_capacity(paragraphs.len());

        for paragraph in paragraphs {
            let chunk_id = Uuid::new_v4().to_string();

            let outcome = match self.embedder.embed_single(request.credential, &paragraph).await {
                Ok(vector) => self
                    .store
                    .upsert(
                        &collection,
                        vec![IndexPoint {
                            chunk_id: chunk_id.clone(),
                            memory_id: memory_id.clone(),
                            text: paragraph,
                            vector,
                        }],
                    )
                    .await
                    .map_err(|e| MemoryError::Backend(e.to_string())),
                Err(e) => Err(MemoryError::Embedding(e.to_string())),
            };

            if let Err(error) = outcome {
                if stored.is_empty() {
                    return Err(error);
                }
                warn!(
                    "Memorize of '{}' for user {} failed after {} chunk(s): {}",
                    memory_id,
                    request.user_id,
                    stored.len(),
                    error
                );
                return Err(MemoryError::Partial {
                    memory_id,
                    stored_chunk_ids: stored,
                    reason: error.to_string(),
                });
            }

            stored.push(chunk_id);
        }

        info!(
            "Memorized '{}' for user {} in {} chunk(s)",
            memory_id,
            request.user_id,
            stored.len()
        );
        Ok(MemoryRecord::new(memory_id, stored))
    }

    /// Drop the user's whole collection
    pub async fn delete_all(&self, user_id: i64) -> Result<(), MemoryError> {
        let collection = collection_name(user_id);
        let exists = self
            .store
            .collection_exists(&collection)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        if !exists {
            debug!("No collection for user {}, nothing to delete", user_id);
            return Ok(());
        }

        self.store
            .delete_collection(&collection)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))
    }

    pub async fn delete_chunks(&self, user_id: i64, chunk_ids: &[String]) -> Result<(), MemoryError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let collection = collection_name(user_id);
        let exists = self
            .store
            .collection_exists(&collection)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        if !exists {
            return Ok(());
        }

        self.store
            .delete_points(&collection, chunk_ids)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkSettings;
    use crate::memory::InMemoryIndex;
    use crate::testing::{FlakyEmbedder, WordEmbedder};

    fn request<'a>(memory_id: &'a str, text: &'a str, taken: &'a HashSet<String>) -> MemorizeRequest<'a> {
        MemorizeRequest {
            credential: "sk-test",
            user_id: 1,
            memory_id,
            text,
            taken,
            chunking: ChunkSettings {
                max_units_per_line: 4,
                max_units_per_paragraph: 4,
                overlap_units: 0,
            },
        }
    }

    #[test]
    fn test_resolve_memory_id() {
        let taken: HashSet<String> = ["notes.txt".to_string(), "plain".to_string()].into_iter().collect();

        assert_eq!(resolve_memory_id("fresh.md", &taken), "fresh.md");

        let renamed = resolve_memory_id("notes.txt", &taken);
        assert!(renamed.starts_with("notes_"));
        assert!(renamed.ends_with(".txt"));
        assert_ne!(renamed, "notes.txt");

        let renamed = resolve_memory_id("plain", &taken);
        assert!(renamed.starts_with("plain_"));
        assert!(!taken.contains(&renamed));
    }

    #[tokio::test]
    async fn test_memorize_stores_every_paragraph() {
        let store = Arc::new(InMemoryIndex::new());
        let index = MemoryIndex::new(Arc::new(WordEmbedder), store.clone());
        let taken = HashSet::new();

        let record = index
            .memorize(request("pets.txt", "cats purr softly\ndogs bark at night", &taken))
            .await
            .unwrap();

        assert_eq!(record.memory_id, "pets.txt");
        assert_eq!(record.chunk_ids.len(), 2);
        assert_eq!(store.point_count("user_1").await, 2);
    }

    #[tokio::test]
    async fn test_same_id_twice_keeps_both() {
        let store = Arc::new(InMemoryIndex::new());
        let index = MemoryIndex::new(Arc::new(WordEmbedder), store.clone());

        let mut taken = HashSet::new();
        let first = index.memorize(request("a.txt", "first doc", &taken)).await.unwrap();
        taken.insert(first.memory_id.clone());
        let second = index.memorize(request("a.txt", "second doc", &taken)).await.unwrap();

        assert_eq!(first.memory_id, "a.txt");
        assert_ne!(second.memory_id, first.memory_id);
        assert_eq!(store.point_count("user_1").await, 2);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder), Arc::new(InMemoryIndex::new()));
        let taken = HashSet::new();
        assert_eq!(
            index.memorize(request("", "text", &taken)).await,
            Err(MemoryError::EmptyMemoryId)
        );
        assert_eq!(
            index.memorize(request("id", "  \n ", &taken)).await,
            Err(MemoryError::EmptyText)
        );
    }

    #[tokio::test]
    async fn test_partial_failure_reports_stored_chunks() {
        let store = Arc::new(InMemoryIndex::new());
        let index = MemoryIndex::new(Arc::new(FlakyEmbedder::failing_after(1)), store.clone());
        let taken = HashSet::new();

        let err = index
            .memorize(request("doc", "one two three four\nfive six seven eight", &taken))
            .await
            .unwrap_err();

        match err {
            MemoryError::Partial {
                memory_id,
                stored_chunk_ids,
                ..
            } => {
                assert_eq!(memory_id, "doc");
                assert_eq!(stored_chunk_ids.len(), 1);
                index.delete_chunks(1, &stored_chunk_ids).await.unwrap();
                assert_eq!(store.point_count("user_1").await, 0);
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_all_is_noop_without_collection() {
        let index = MemoryIndex::new(Arc::new(WordEmbedder), Arc::new(InMemoryIndex::new()));
        index.delete_all(42).await.unwrap();
        index.delete_chunks(42, &["nope".into()]).await.unwrap();
    }
}
