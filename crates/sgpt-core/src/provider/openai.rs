//! ============================================================================
//! OpenAI Provider - Chat completions via the OpenAI API
//! ============================================================================
//! Also serves any OpenAI-compatible endpoint (local servers, gateways) when
//! built with a custom base URL and model override.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{CompletionRequest, ModelProvider, ProviderError};

pub struct OpenAiProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    /// Replaces the requested model id when set
    model_override: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        name: &str,
        base_url: &str,
        model_override: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model_override,
        })
    }

    fn error(&self, message: impl ToString) -> ProviderError {
        ProviderError::Request {
            provider: self.name.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let model = self
            .model_override
            .clone()
            .unwrap_or_else(|| request.model_id.clone());

        debug!(
            "Calling {} ({}) with {} messages",
            self.name,
            model,
            request.messages.len()
        );

        let body = ChatRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str().to_string(),
                    content: m.text.clone(),
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&request.credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                provider: self.name.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: self.name.clone(),
                message: e.to_string(),
            }
        })?;

        Ok(chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use crate::types::Role;

    #[test]
    fn test_request_shape() {
        let body = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![WireMessage {
                role: Role::System.as_str().into(),
                content: "be brief".into(),
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"][0]["role"], "system");
    }

    #[test]
    fn test_response_parsing() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"Hi!"}}]}"#)
                .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Hi!"));

        let null_content: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(null_content.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let provider = OpenAiProvider::new(
            "custom",
            "http://127.0.0.1:9/v1",
            Some("local".into()),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = provider
            .complete(&CompletionRequest {
                credential: "k".into(),
                model_id: "ignored".into(),
                messages: vec![ChatMessage::new(Role::User, "hi")],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Request { .. }));
    }
}
