//! ============================================================================
//! Memory Types - Index points, search hits and memory errors
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::chunker::ChunkSettings;

/// One embedded paragraph as stored in a user's collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPoint {
    pub chunk_id: String,
    /// Memory the paragraph was cut from
    pub memory_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub vector: Vec<f32>,
}

/// A similarity search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub memory_id: String,
    pub text: String,
    pub score: f32,
}

/// Everything needed to index one document for one user
#[derive(Debug, Clone)]
pub struct MemorizeRequest<'a> {
    /// Provider credential used for embeddings
    pub credential: &'a str,
    pub user_id: i64,
    /// Requested id; renamed when it collides with `taken`
    pub memory_id: &'a str,
    pub text: &'a str,
    /// Memory ids the user already owns
    pub taken: &'a HashSet<String>,
    pub chunking: ChunkSettings,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("Nothing to memorize: text is empty")]
    EmptyText,

    #[error("Memory id must not be empty")]
    EmptyMemoryId,

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Vector index failed: {0}")]
    Backend(String),

    /// Some chunks were stored before a later one failed
    #[error("Memorizing '{memory_id}' stopped after {} chunk(s): {reason}", .stored_chunk_ids.len())]
    Partial {
        memory_id: String,
        stored_chunk_ids: Vec<String>,
        reason: String,
    },
}
