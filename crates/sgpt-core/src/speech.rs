//! ============================================================================
//! Speech Synthesis - Text to voice for voice-mode replies
//! ============================================================================
//! Uses an OpenAI-compatible `/audio/speech` endpoint and returns Opus audio,
//! which chat transports can send as a voice note.
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TTS_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TTS_MODEL: &str = "tts-1";
pub const DEFAULT_TTS_VOICE: &str = "alloy";

/// The speech endpoint rejects longer inputs
const MAX_INPUT_CHARS: usize = 4096;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, credential: &str, text: &str) -> Result<Vec<u8>>;
}

pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

impl OpenAiSpeech {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: DEFAULT_TTS_MODEL.to_string(),
            voice: DEFAULT_TTS_VOICE.to_string(),
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, credential: &str, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            bail!("Nothing to synthesize");
        }
        if text.chars().count() > MAX_INPUT_CHARS {
            bail!("Text too long for speech synthesis ({} chars)", text.chars().count());
        }

        debug!("Synthesizing {} chars with voice {}", text.len(), self.voice);

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(credential)
            .json(&SpeechRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: "opus",
            })
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call speech API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Speech API error {}: {}", status, body));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read speech audio: {}", e))?;

        Ok(audio.to_vec())
    }
}
