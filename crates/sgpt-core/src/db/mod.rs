// ============================================================================
// UserStore - Durable per-user records (redb)
// ============================================================================
// One record per end-user identity, keyed by the transport's numeric id.
// Default path: ~/.sgpt/users.redb (override via SGPT_DB_PATH env var)
// ============================================================================

pub mod in_memory;
pub mod types;

pub use in_memory::InMemoryUserStore;
pub use types::{StoreError, StoreStats};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::UserRecord;

const USERS: TableDefinition<i64, &[u8]> = TableDefinition::new("users");

/// Persistence seam for user records. Implementations must make
/// `get_or_create` atomic per id.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Return the record for `seed.id`, inserting `seed` when none exists
    async fn get_or_create(&self, seed: UserRecord) -> Result<UserRecord, StoreError>;

    /// Replace an existing record. Unknown ids fail with `NotFound`.
    async fn update(&self, record: &UserRecord) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;

    /// Every record, ordered by id
    async fn list_all(&self) -> Result<Vec<UserRecord>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let all = self.list_all().await?;
        Ok(StoreStats::from_records(&all))
    }
}

fn backend(context: &str, e: impl Display) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, e))
}

fn encode(record: &UserRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<UserRecord, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// redb-backed user store
#[derive(Clone)]
pub struct RedbUserStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbUserStore {
    /// Open (or create) the store at the given path.
    /// If `path` is None, uses SGPT_DB_PATH env var or ~/.sgpt/users.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("SGPT_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let sgpt_dir = home.join(".sgpt");
            std::fs::create_dir_all(&sgpt_dir)
                .map_err(|e| anyhow!("Failed to create .sgpt directory: {}", e))?;
            sgpt_dir.join("users.redb")
        };

        info!("Opening user store at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(USERS)
                .map_err(|e| anyhow!("Failed to create users table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self {
            db: Arc::new(db),
            path: db_path,
        })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| backend("Store task failed", e))?
    }
}

#[async_trait]
impl UserStore for RedbUserStore {
    async fn get_or_create(&self, seed: UserRecord) -> Result<UserRecord, StoreError> {
        self.blocking(move |db| {
            let write_txn = db.begin_write().map_err(|e| backend("Failed to begin write", e))?;
            let record = {
                let mut table = write_txn
                    .open_table(USERS)
                    .map_err(|e| backend("Failed to open users table", e))?;

                let existing = table
                    .get(seed.id)
                    .map_err(|e| backend("Failed to get user", e))?
                    .map(|value| decode(value.value()))
                    .transpose()?;

                match existing {
                    Some(record) => record,
                    None => {
                        let bytes = encode(&seed)?;
                        table
                            .insert(seed.id, bytes.as_slice())
                            .map_err(|e| backend("Failed to insert user", e))?;
                        info!("Created user record: {}", seed.id);
                        seed
                    }
                }
            };
            write_txn.commit().map_err(|e| backend("Failed to commit", e))?;
            Ok(record)
        })
        .await
    }

    async fn update(&self, record: &UserRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |db| {
            let bytes = encode(&record)?;
            let write_txn = db.begin_write().map_err(|e| backend("Failed to begin write", e))?;
            {
                let mut table = write_txn
                    .open_table(USERS)
                    .map_err(|e| backend("Failed to open users table", e))?;

                let exists = table
                    .get(record.id)
                    .map_err(|e| backend("Failed to get user", e))?
                    .is_some();
                if !exists {
                    return Err(StoreError::NotFound(record.id));
                }

                table
                    .insert(record.id, bytes.as_slice())
                    .map_err(|e| backend("Failed to insert user", e))?;
            }
            write_txn.commit().map_err(|e| backend("Failed to commit", e))?;

            debug!("Updated user record: {}", record.id);
            Ok(())
        })
        .await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(|e| backend("Failed to begin read", e))?;
            let table = read_txn
                .open_table(USERS)
                .map_err(|e| backend("Failed to open users table", e))?;

            match table.get(id).map_err(|e| backend("Failed to get user", e))? {
                Some(value) => Ok(Some(decode(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.blocking(|db| {
            let read_txn = db.begin_read().map_err(|e| backend("Failed to begin read", e))?;
            let table = read_txn
                .open_table(USERS)
                .map_err(|e| backend("Failed to open users table", e))?;

            let mut results = Vec::new();
            let iter = table
                .range::<i64>(..)
                .map_err(|e| backend("Failed to iterate users", e))?;
            for entry in iter {
                let (_key, value) = entry.map_err(|e| backend("Failed to read entry", e))?;
                results.push(decode(value.value())?);
            }
            Ok(results)
        })
        .await
    }
}
