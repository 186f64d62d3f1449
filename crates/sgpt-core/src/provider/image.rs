//! ============================================================================
//! Image Generation - OpenAI images API
//! ============================================================================
//! Generates a single image from a prompt with the user's quality and style
//! settings and returns the decoded bytes.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::types::{ImgQuality, ImgStyle};

/// Default image model
pub const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        credential: &str,
        prompt: &str,
        quality: ImgQuality,
        style: ImgStyle,
    ) -> Result<Vec<u8>>;
}

pub struct OpenAiImageGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiImageGenerator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: DEFAULT_IMAGE_MODEL.to_string(),
        })
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    async fn generate(
        &self,
        credential: &str,
        prompt: &str,
        quality: ImgQuality,
        style: ImgStyle,
    ) -> Result<Vec<u8>> {
        let preview: String = prompt.chars().take(50).collect();
        info!("Generating image: {}...", preview);

        let request = ImageRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            n: 1,
            quality: quality.api_value(),
            style: style.api_value(),
            response_format: "b64_json",
        };

        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(credential)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call image API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Image API error {}: {}", status, body));
        }

        let image_response: ImageResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse image response: {}", e))?;

        let bytes = decode_first(&image_response)?;
        info!("Image generated: {} bytes", bytes.len());
        Ok(bytes)
    }
}

fn decode_first(response: &ImageResponse) -> Result<Vec<u8>> {
    let b64 = response
        .data
        .first()
        .and_then(|d| d.b64_json.as_ref())
        .ok_or_else(|| anyhow!("No image data in response"))?;

    STANDARD
        .decode(b64)
        .map_err(|e| anyhow!("Failed to decode base64 image: {}", e))
}

// ============================================================================
// Image API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    n: u32,
    quality: &'static str,
    style: &'static str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}
