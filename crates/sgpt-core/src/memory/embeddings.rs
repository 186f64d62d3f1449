//! ============================================================================
//! Embedding Service - Vector embeddings for memory indexing and recall
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible `/embeddings`
//! endpoint. The caller's own provider credential authorizes every request.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default embedding model (OpenAI compatible)
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default API base
pub const DEFAULT_EMBEDDINGS_URL: &str = "https://api.openai.com/v1";

/// Turns text into vectors. One vector per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, credential: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed_single(&self, credential: &str, text: &str) -> Result<Vec<f32>> {
        self.embed(credential, vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned"))
    }
}

/// Embedding service for generating text vectors
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    model: String,
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl EmbeddingService {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn openai(timeout: Duration) -> Result<Self> {
        Self::new(DEFAULT_EMBEDDINGS_URL, DEFAULT_EMBEDDING_MODEL, timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, credential: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: &texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(credential)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send embedding request: {}", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(anyhow!(
                    "Embedding API error ({}): {}",
                    status,
                    error.error.message
                ));
            }
            return Err(anyhow!("Embedding API error ({}): {}", status, body));
        }

        let embedding_response: EmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse embedding response: {}", e))?;

        if let Some(usage) = &embedding_response.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, embedding_response.model
            );
        }

        if embedding_response.data.len() != texts.len() {
            return Err(anyhow!(
                "Embedding API returned {} vectors for {} inputs",
                embedding_response.data.len(),
                texts.len()
            ));
        }

        let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_creation() {
        let service = EmbeddingService::new(
            "http://localhost:8080/v1/",
            "nomic-embed-text",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(service.base_url(), "http://localhost:8080/v1");
        assert_eq!(service.model(), "nomic-embed-text");

        let openai = EmbeddingService::openai(Duration::from_secs(5)).unwrap();
        assert_eq!(openai.base_url(), DEFAULT_EMBEDDINGS_URL);
        assert_eq!(openai.model(), DEFAULT_EMBEDDING_MODEL);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let service = EmbeddingService::openai(Duration::from_secs(5)).unwrap();
        let result = service.embed("test-key", vec![]).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_response_parsing_orders_by_index() {
        let body = r#"{"data":[{"embedding":[0.2],"index":1},{"embedding":[0.1],"index":0}],
            "model":"m","usage":{"prompt_tokens":2,"total_tokens":2}}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(body).unwrap();
        let mut data: Vec<_> = parsed.data.into_iter().map(|d| (d.index, d.embedding)).collect();
        data.sort_by_key(|(i, _)| *i);
        assert_eq!(data[0].1, vec![0.1]);
    }
}
