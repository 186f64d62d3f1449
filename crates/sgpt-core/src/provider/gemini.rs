//! ============================================================================
//! Gemini Provider - Google generateContent API
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{split_system, CompletionRequest, ModelProvider, ProviderError};
use crate::types::Role;

pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn build_request(request: &CompletionRequest) -> GenerateRequest {
    let (system, rest) = split_system(&request.messages);
    GenerateRequest {
        system_instruction: system.map(|text| Content {
            role: None,
            parts: vec![Part { text: Some(text) }],
        }),
        contents: rest
            .into_iter()
            .map(|m| Content {
                role: Some(if m.role == Role::Assistant { "model" } else { "user" }.to_string()),
                parts: vec![Part {
                    text: Some(m.text.clone()),
                }],
            })
            .collect(),
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        debug!(
            "Calling Gemini ({}) with {} messages",
            request.model_id,
            request.messages.len()
        );

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, request.model_id
            ))
            .query(&[("key", request.credential.as_str())])
            .json(&build_request(request))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: "gemini".into(),
                // reqwest errors may echo the URL, which carries the key
                message: e.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                provider: "gemini".into(),
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse {
                    provider: "gemini".into(),
                    message: e.without_url().to_string(),
                })?;

        Ok(parsed.text())
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
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

    #[test]
    fn test_request_maps_roles() {
        let request = CompletionRequest {
            credential: "k".into(),
            model_id: "gemini-1.5-pro".into(),
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
                ChatMessage::new(Role::Assistant, "hello"),
            ],
        };
        let json = serde_json::to_value(build_request(&request)).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
    }

    #[test]
    fn test_response_text() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"},{"text":"!"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.text(), "Hi!");

        let blocked: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert_eq!(blocked.text(), "");
    }
}
