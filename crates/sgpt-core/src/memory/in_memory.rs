//! ============================================================================
//! In-Memory Vector Index - Brute-force cosine search, no external service
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::store::VectorIndex;
use super::types::{IndexPoint, ScoredChunk};

#[derive(Default)]
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, Vec<IndexPoint>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut collections = self.collections.write().await;
        let stored = collections.entry(collection.to_string()).or_default();

        if let Some(dimension) = stored.first().map(|p| p.vector.len()) {
            if let Some(bad) = points.iter().find(|p| p.vector.len() != dimension) {
                return Err(anyhow!(
                    "Vector dimension mismatch for {}: expected {}, got {}",
                    bad.chunk_id,
                    dimension,
                    bad.vector.len()
                ));
            }
        }

        for point in points {
            stored.retain(|existing| existing.chunk_id != point.chunk_id);
            stored.push(point);
        }
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
        let collections = self.collections.read().await;
        let Some(points) = collections.get(collection) else {
            return Ok(vec![]);
        };

        let mut hits: Vec<ScoredChunk> = points
            .iter()
            .filter(|point| memory_ids.map_or(true, |ids| ids.contains(&point.memory_id)))
            .map(|point| ScoredChunk {
                chunk_id: point.chunk_id.clone(),
                memory_id: point.memory_id.clone(),
                text: point.text.clone(),
                score: cosine(&vector, &point.vector),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit as usize);
        Ok(hits)
    }

    async fn delete_collection(&self, collection: &str) -> Result<()> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn delete_points(&self, collection: &str, chunk_ids: &[String]) -> Result<()> {
        if let Some(points) = self.collections.write().await.get_mut(collection) {
            points.retain(|point| !chunk_ids.contains(&point.chunk_id));
        }
        Ok(())
    }
}
