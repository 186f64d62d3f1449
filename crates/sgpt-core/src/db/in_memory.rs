//! ============================================================================
//! In-Memory User Store - Ephemeral store for tests and throwaway runs
//! ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{StoreError, UserStore};
use crate::types::UserRecord;

/// Process-local store with the same contract as the redb store
#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<i64, UserRecord>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_or_create(&self, seed: UserRecord) -> Result<UserRecord, StoreError> {
        let mut users = self.users.write().await;
        Ok(users.entry(seed.id).or_insert(seed).clone())
    }

    async fn update(&self, record: &UserRecord) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        let mut all: Vec<UserRecord> = self.users.read().await.values().cloned().collect();
        all.sort_by_key(|user| user.id);
        Ok(all)
    }
}
