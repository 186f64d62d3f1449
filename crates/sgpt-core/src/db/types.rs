//! ============================================================================
//! Store Types - Errors and statistics for the user store
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::types::UserRecord;

/// User store failures. Always surfaced to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("User not found: {0}")]
    NotFound(i64),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Storage backend failed: {0}")]
    Backend(String),
}

/// Aggregate counters over every stored record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_users: usize,
    pub blocked_users: usize,
    pub administrators: usize,
    pub memorized_items: usize,
    pub conversation_turns: usize,
}

impl StoreStats {
    pub fn from_records(records: &[UserRecord]) -> Self {
        records.iter().fold(Self::default(), |mut stats, user| {
            stats.total_users += 1;
            if user.is_blocked {
                stats.blocked_users += 1;
            }
            if user.is_administrator {
                stats.administrators += 1;
            }
            stats.memorized_items += user.memory_storage.len();
            stats.conversation_turns += user.conversation.len();
            stats
        })
    }
}
