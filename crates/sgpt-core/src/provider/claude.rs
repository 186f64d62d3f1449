//! ============================================================================
//! Claude Provider - Anthropic messages API
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{split_system, CompletionRequest, ModelProvider, ProviderError};
use crate::types::Role;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    client: reqwest::Client,
    base_url: String,
    max_tokens: u32,
}

impl ClaudeProvider {
    pub fn new(base_url: &str, max_tokens: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens,
        })
    }
}

fn build_request(request: &CompletionRequest, max_tokens: u32) -> MessagesRequest {
    let (system, rest) = split_system(&request.messages);
    MessagesRequest {
        model: request.model_id.clone(),
        max_tokens,
        system,
        messages: rest
            .into_iter()
            .map(|m| WireMessage {
                role: if m.role == Role::Assistant { "assistant" } else { "user" },
                content: m.text.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl ModelProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        debug!(
            "Calling Anthropic ({}) with {} messages",
            request.model_id,
            request.messages.len()
        );

        let body = build_request(request, self.max_tokens);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &request.credential)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: "claude".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                provider: "claude".into(),
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: "claude".into(),
                    message: e.to_string(),
                })?;

        Ok(parsed.text())
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}
