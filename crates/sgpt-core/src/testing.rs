//! Test doubles shared by the unit test modules

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::db::{InMemoryUserStore, StoreError, UserStore};
use crate::links::LinkExpander;
use crate::memory::Embedder;
use crate::provider::{ChatMessage, CompletionRequest, ImageGenerator, ModelProvider, ProviderError};
use crate::speech::SpeechSynthesizer;
use crate::types::{ImgQuality, ImgStyle, UserRecord};

// ============================================================================
// Embedders
// ============================================================================

const WORD_DIMENSION: usize = 512;

/// Bag-of-words embedder. Every distinct word gets its own axis, so cosine
/// similarity is exact word overlap.
pub struct WordEmbedder;

impl WordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        static VOCABULARY: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
        let vocabulary = VOCABULARY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut vocabulary = vocabulary.lock().unwrap();

        let mut vector = vec![0.0f32; WORD_DIMENSION];
        for word in text.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let next = vocabulary.len();
            let axis = *vocabulary.entry(word).or_insert(next);
            vector[axis % WORD_DIMENSION] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for WordEmbedder {
    async fn embed(&self, _credential: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| Self::vector(text)).collect())
    }
}

/// Succeeds for the first `n` calls, then fails
pub struct FlakyEmbedder {
    remaining: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn failing_after(n: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(n),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, credential: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(anyhow!("embedding service unavailable"));
        }
        WordEmbedder.embed(credential, texts).await
    }
}

pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, credential: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.0).await;
        WordEmbedder.embed(credential, texts).await
    }
}

// ============================================================================
// Model providers
// ============================================================================

/// Answers "echo: <last message>" and records every request it sees
#[derive(Default)]
pub struct EchoProvider {
    pub delay: Option<Duration>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl EchoProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let last = request
            .messages
            .last()
            .map(|m| m.text.clone())
            .unwrap_or_default();
        Ok(format!("echo: {}", last))
    }
}

/// Always answers with a fixed string (possibly empty)
pub struct FixedProvider(pub &'static str);

#[async_trait]
impl ModelProvider for FixedProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
        Ok(self.0.to_string())
    }
}

pub struct FailingProvider;

#[async_trait]
impl ModelProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
        Err(ProviderError::Api {
            provider: "failing".into(),
            status: 429,
            message: "rate limited".into(),
        })
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory store whose writes can be switched off
#[derive(Default)]
pub struct FailingStore {
    pub inner: InMemoryUserStore,
    pub fail_updates: AtomicBool,
}

impl FailingStore {
    pub fn set_failing(&self, failing: bool) {
        self.fail_updates.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for FailingStore {
    async fn get_or_create(&self, seed: UserRecord) -> Result<UserRecord, StoreError> {
        self.inner.get_or_create(seed).await
    }

    async fn update(&self, record: &UserRecord) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.update(record).await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.inner.get_by_id(id).await
    }

    async fn list_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.inner.list_all().await
    }
}

// ============================================================================
// Speech and images
// ============================================================================

pub struct FakeSpeech {
    pub fail: bool,
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(&self, _credential: &str, text: &str) -> Result<Vec<u8>> {
        if self.fail {
            return Err(anyhow!("tts offline"));
        }
        Ok(text.as_bytes().to_vec())
    }
}

pub struct FakeImages;

#[async_trait]
impl ImageGenerator for FakeImages {
    async fn generate(
        &self,
        _credential: &str,
        prompt: &str,
        quality: ImgQuality,
        style: ImgStyle,
    ) -> Result<Vec<u8>> {
        Ok(format!("{}|{}|{}", prompt, quality.api_value(), style.api_value()).into_bytes())
    }
}

// ============================================================================
// Link expansion
// ============================================================================

/// Returns a fixed transcript, or fails when none is set
pub struct FakeLinks(pub Option<&'static str>);

#[async_trait]
impl LinkExpander for FakeLinks {
    async fn fetch_text(&self, _credential: &str, url: &str) -> Result<String> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no transcript for {}", url))
    }
}
