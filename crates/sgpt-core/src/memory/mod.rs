//! ============================================================================
//! Memory Module - Retrieval-augmented memory for every user
//! ============================================================================
//! Users memorize arbitrary text; relevant fragments are recalled into later
//! conversations by vector similarity.
//!
//! ## Architecture
//! ```text
//! /memorize text → TextChunker → Embed each paragraph → user_<id> collection
//!
//! user message → Embed → Similarity search (≥ min relevance, ≤ limit)
//!                              ↓
//!                 filter by working-memory ids → fragments
//!                              ↓
//!              [System] + [Reference fragments] + [History] + [Message]
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use sgpt_core::memory::{EmbeddingService, MemoryIndex, MemoryRecall, QdrantIndex};
//!
//! let embedder = Arc::new(EmbeddingService::openai(timeout)?);
//! let store = Arc::new(QdrantIndex::new("http://localhost:6334")?);
//! let index = MemoryIndex::new(embedder.clone(), store.clone());
//! let recall = MemoryRecall::new(embedder, store, RecallSettings::default());
//!
//! let fragments = recall.recall(api_key, user_id, "what did I say about cats", None).await;
//! ```
//! ============================================================================

mod embeddings;
mod in_memory;
mod index;
mod recall;
mod store;
mod types;

pub use embeddings::{Embedder, EmbeddingService, DEFAULT_EMBEDDINGS_URL, DEFAULT_EMBEDDING_MODEL};
pub use in_memory::InMemoryIndex;
pub use index::{resolve_memory_id, MemoryIndex};
pub use recall::{
    MemoryRecall, RecallSettings, DEFAULT_CACHE_DURATION_SECS, DEFAULT_MIN_RELEVANCE,
    DEFAULT_RECALL_LIMIT,
};
pub use store::{QdrantIndex, VectorIndex};
pub use types::{IndexPoint, MemorizeRequest, MemoryError, ScoredChunk};

/// Name of the collection holding a user's memory
pub fn collection_name(user_id: i64) -> String {
    format!("user_{}", user_id)
}
