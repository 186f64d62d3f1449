//! ============================================================================
//! Memory Recall - Best-effort similarity retrieval for conversational turns
//! ============================================================================
//! Recall never fails a turn: a missing collection, an embedding error, a
//! backend error or a timeout all yield an empty result. Non-empty results
//! are cached per (credential, query, user, candidate set).
//! ============================================================================

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::collection_name;
use super::embeddings::Embedder;
use super::store::VectorIndex;

/// Default number of fragments returned
pub const DEFAULT_RECALL_LIMIT: usize = 3;

/// Default minimum relevance score
pub const DEFAULT_MIN_RELEVANCE: f32 = 0.7;

/// Default cache lifetime (one day)
pub const DEFAULT_CACHE_DURATION_SECS: i64 = 86_400;

/// Maximum number of cached recall results
const MAX_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct RecallSettings {
    pub limit: usize,
    pub min_relevance: f32,
    pub timeout: Duration,
    pub cache_duration_secs: i64,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RECALL_LIMIT,
            min_relevance: DEFAULT_MIN_RELEVANCE,
            timeout: Duration::from_secs(10),
            cache_duration_secs: DEFAULT_CACHE_DURATION_SECS,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRecall {
    user_id: i64,
    fragments: Vec<String>,
    cached_at: i64,
}

pub struct MemoryRecall {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorIndex>,
    settings: RecallSettings,
    cache: Arc<RwLock<HashMap<String, CachedRecall>>>,
}

fn cache_key(credential: &str, query: &str, user_id: i64, candidates: Option<&HashSet<String>>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hasher.update([0u8]);
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_id.to_le_bytes());
    match candidates {
        Some(ids) => {
            let mut sorted: Vec<&String> = ids.iter().collect();
            sorted.sort();
            for id in sorted {
                hasher.update([0u8]);
                hasher.update(id.as_bytes());
            }
        }
        None => hasher.update([1u8]),
    }
    hex::encode(hasher.finalize())
}

impl MemoryRecall {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorIndex>, settings: RecallSettings) -> Self {
        Self {
            embedder,
            store,
            settings,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &RecallSettings {
        &self.settings
    }

    /// Up to `limit` fragments scoring at least `min_relevance`, best first.
    /// `candidates` restricts hits to the given memory ids.
    pub async fn recall(
        &self,
        credential: &str,
        user_id: i64,
        query: &str,
        candidates: Option<&HashSet<String>>,
    ) -> Vec<String> {
        if query.trim().is_empty() || self.settings.limit == 0 {
            return vec![];
        }
        if candidates.is_some_and(|ids| ids.is_empty()) {
            debug!("Recall for user {} skipped: working set is empty", user_id);
            return vec![];
        }

        let key = cache_key(credential, query, user_id, candidates);
        let now = chrono::Utc::now().timestamp();

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                if now - cached.cached_at < self.settings.cache_duration_secs {
                    debug!("Recall cache hit for user {}", user_id);
                    return cached.fragments.clone();
                }
            }
        }

        let fragments = match tokio::time::timeout(
            self.settings.timeout,
            self.search(credential, user_id, query, candidates),
        )
        .await
        {
            Ok(Ok(fragments)) => fragments,
            Ok(Err(e)) => {
                warn!("Recall failed for user {}: {}", user_id, e);
                return vec![];
            }
            Err(_) => {
                warn!(
                    "Recall timed out for user {} after {:?}",
                    user_id, self.settings.timeout
                );
                return vec![];
            }
        };

        if !fragments.is_empty() {
            let mut cache = self.cache.write().await;
            if cache.len() >= MAX_CACHE_SIZE {
                if let Some(oldest_key) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.cached_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest_key);
                }
            }
            cache.insert(
                key,
                CachedRecall {
                    user_id,
                    fragments: fragments.clone(),
                    cached_at: now,
                },
            );
        }

        fragments
    }

    async fn search(
        &self,
        credential: &str,
        user_id: i64,
        query: &str,
        candidates: Option<&HashSet<String>>,
    ) -> Result<Vec<String>> {
        let collection = collection_name(user_id);
        if !self.store.collection_exists(&collection).await? {
            return Ok(vec![]);
        }

        let vector = self.embedder.embed_single(credential, query).await?;
        let limit = u64::try_from(self.settings.limit).unwrap_or(u64::MAX);

        let mut hits = self
            .store
            .search(&collection, vector, limit, self.settings.min_relevance, candidates)
            .await?;
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        let fragments: Vec<String> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.settings.min_relevance)
            .take(self.settings.limit)
            .map(|hit| hit.text)
            .collect();

        debug!("Recalled {} fragment(s) for user {}", fragments.len(), user_id);
        Ok(fragments)
    }

    /// Forget cached results for a user whose memory changed
    pub async fn invalidate_user(&self, user_id: i64) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, cached| cached.user_id != user_id);
        let removed = before - cache.len();
        if removed > 0 {
            debug!("Invalidated {} cached recall(s) for user {}", removed, user_id);
        }
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}
