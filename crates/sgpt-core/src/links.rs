//! ============================================================================
//! Link Expansion - Replace a leading link with text fetched for it
//! ============================================================================
//! A message that starts with a URL (a video, an article) is sent to a text
//! extraction service, and the returned transcript stands in for the
//! message. Expansion is best-effort: any failure keeps the original text.
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait LinkExpander: Send + Sync {
    /// Text behind `url`; an error or empty text means "keep the message"
    async fn fetch_text(&self, credential: &str, url: &str) -> Result<String>;
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(https?|ftp|file)://[-A-Za-z0-9+&@#/%?=~_|!:,.;]*[-A-Za-z0-9+&@#/%=~_|]").ok()
    })
    .as_ref()
}

/// URL at the very start of `text`, if any
pub fn leading_url(text: &str) -> Option<&str> {
    url_regex()?.find(text.trim_start()).map(|m| m.as_str())
}

/// Client for a transcript service taking `?url=<link>&token=<credential>`
pub struct TranscriptService {
    client: reqwest::Client,
    api_url: String,
}

impl TranscriptService {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_url: api_url.trim().to_string(),
        })
    }
}

#[async_trait]
impl LinkExpander for TranscriptService {
    async fn fetch_text(&self, credential: &str, url: &str) -> Result<String> {
        debug!("Fetching text for {}", url);

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("url", url), ("token", credential)])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call transcript service: {}", e))?;

        if !response.status().is_success() {
            bail!("Transcript service error {}", response.status());
        }

        response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read transcript: {}", e))
    }
}
