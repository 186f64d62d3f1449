//! ============================================================================
//! Vector Store - Per-user collections of embedded paragraphs
//! ============================================================================
//! `VectorIndex` is the seam between the memory engine and the similarity
//! backend. `QdrantIndex` keeps one Qdrant collection per user, created
//! lazily on the first upsert with the dimension of the first vector.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, Condition, CreateCollectionBuilder, DeleteCollectionBuilder,
    DeletePointsBuilder, Distance, Filter, PointId, PointStruct, PointsIdsList, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::types::{IndexPoint, ScoredChunk};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Insert or replace points, creating the collection when absent
    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> Result<()>;

    /// Nearest points with score >= `min_score`, best first.
    /// `memory_ids` restricts hits to points of those memories before `limit` applies.
    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        min_score: f32,
        memory_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<ScoredChunk>>;

    async fn delete_collection(&self, collection: &str) -> Result<()>;

    async fn delete_points(&self, collection: &str, chunk_ids: &[String]) -> Result<()>;
}

/// Vector index backed by Qdrant
pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    pub fn new(url: &str) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", url);

        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| anyhow!("Failed to create Qdrant client: {}", e))?;

        Ok(Self { client })
    }

    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        info!("Creating collection: {} (dim {})", collection, dimension);

        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| anyhow!("Failed to create collection: {}", e))?;

        Ok(())
    }

    /// Check if the store is healthy/connected
    pub async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        self.client
            .collection_exists(collection)
            .await
            .map_err(|e| anyhow!("Failed to check collection existence: {}", e))
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> Result<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.ensure_collection(collection, first.vector.len()).await?;

        let count = points.len();
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: HashMap<String, Value> = [
                    ("memory_id".to_string(), Value::from(point.memory_id)),
                    ("text".to_string(), Value::from(point.text)),
                ]
                .into_iter()
                .collect();
                PointStruct::new(point.chunk_id, point.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(|e| anyhow!("Failed to upsert points: {}", e))?;

        debug!("Upserted {} point(s) into {}", count, collection);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        min_score: f32,
        memory_ids: Option<&HashSet<String>>,
    ) -> Result<Vec<ScoredChunk>> {
        let mut request = SearchPointsBuilder::new(collection, vector, limit)
            .score_threshold(min_score)
            .with_payload(true);

        if let Some(ids) = memory_ids {
            let ids: Vec<String> = ids.iter().cloned().collect();
            request = request.filter(Filter::must([Condition::matches("memory_id", ids)]));
        }

        let search_result = self
            .client
            .search_points(request)
            .await
            .map_err(|e| anyhow!("Failed to search points: {}", e))?;

        let hits = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                let chunk_id = point_id_string(point.id?)?;
                Some(ScoredChunk {
                    chunk_id,
                    memory_id: get_string(&point.payload, "memory_id")?,
                    text: get_string(&point.payload, "text")?,
                    score: point.score,
                })
            })
            .collect();

        Ok(hits)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        if !self.collection_exists(collection).await? {
            return Ok(());
        }

        self.client
            .delete_collection(DeleteCollectionBuilder::new(collection))
            .await
            .map_err(|e| anyhow!("Failed to delete collection: {}", e))?;

        info!("Deleted collection {}", collection);
        Ok(())
    }

    async fn delete_points(&self, collection: &str, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() || !self.collection_exists(collection).await? {
            return Ok(());
        }

        let ids: Vec<PointId> = chunk_ids.iter().cloned().map(PointId::from).collect();

        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| anyhow!("Failed to delete points: {}", e))?;

        debug!("Deleted {} point(s) from {}", chunk_ids.len(), collection);
        Ok(())
    }
}

fn point_id_string(point_id: PointId) -> Option<String> {
    match point_id.point_id_options? {
        PointIdOptions::Uuid(uuid) => Some(uuid),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Require a running Qdrant instance

    #[tokio::test]
    #[ignore]
    async fn test_upsert_search_delete() {
        let index = QdrantIndex::new("http://localhost:6334").unwrap();
        let collection = "user_test_sgpt";
        let chunk_id = uuid::Uuid::new_v4().to_string();

        index
            .upsert(
                collection,
                vec![IndexPoint {
                    chunk_id: chunk_id.clone(),
                    memory_id: "notes.txt".into(),
                    text: "The cat sleeps on the mat".into(),
                    vector: vec![0.1; 8],
                }],
            )
            .await
            .unwrap();

        let hits = index.search(collection, vec![0.1; 8], 3, 0.5, None).await.unwrap();
        assert_eq!(hits[0].chunk_id, chunk_id);
        assert_eq!(hits[0].memory_id, "notes.txt");

        let other: HashSet<String> = ["todo.txt".to_string()].into_iter().collect();
        let filtered = index
            .search(collection, vec![0.1; 8], 3, 0.5, Some(&other))
            .await
            .unwrap();
        assert!(filtered.is_empty());

        index.delete_collection(collection).await.unwrap();
        assert!(!index.collection_exists(collection).await.unwrap());
    }
}
