//! ============================================================================
//! Provider Module - Chat completion backends
//! ============================================================================
//! Every backend implements `ModelProvider`. The dispatcher only ever sees
//! a `Model` value; `ProviderRegistry` maps it to an implementation:
//! - OpenAiProvider: OpenAI chat completions (also any compatible endpoint)
//! - ClaudeProvider: Anthropic messages API
//! - GeminiProvider: Google generateContent
//!
//! Image generation lives in `image` and shares the OpenAI API base.
//! ============================================================================

mod claude;
mod gemini;
mod image;
mod openai;

pub use claude::ClaudeProvider;
pub use gemini::GeminiProvider;
pub use image::{ImageGenerator, OpenAiImageGenerator};
pub use openai::OpenAiProvider;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{Model, ProviderKind, Role};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Upper bound on generated tokens for providers that require one
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One message of the assembled prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub credential: String,
    /// Provider-side model id
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Request to {provider} failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Unexpected {provider} response: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("No provider available for model {0}")]
    Unavailable(String),

    #[error("Model did not answer within {0} seconds")]
    Timeout(u64),
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Complete the conversation. An empty answer is returned as-is.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Endpoints and limits shared by the built-in providers
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub openai_url: String,
    pub anthropic_url: String,
    pub gemini_url: String,
    /// OpenAI-compatible endpoint backing `Model::Custom`
    pub custom_url: Option<String>,
    pub custom_model: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            anthropic_url: DEFAULT_ANTHROPIC_URL.to_string(),
            gemini_url: DEFAULT_GEMINI_URL.to_string(),
            custom_url: None,
            custom_model: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(120),
        }
    }
}

/// A provider picked for a model, with the model id to send
#[derive(Clone)]
pub struct ResolvedProvider {
    pub provider: Arc<dyn ModelProvider>,
    pub model_id: String,
}

/// Maps each `Model` to the provider that serves it
pub struct ProviderRegistry {
    providers: HashMap<Model, Arc<dyn ModelProvider>>,
    default_model: Model,
}

impl ProviderRegistry {
    pub fn new(default_model: Model) -> Self {
        Self {
            providers: HashMap::new(),
            default_model,
        }
    }

    /// Register every catalogue model with its family's built-in provider
    pub fn with_defaults(settings: &ProviderSettings, default_model: Model) -> Result<Self> {
        let openai: Arc<dyn ModelProvider> =
            Arc::new(OpenAiProvider::new("openai", &settings.openai_url, None, settings.timeout)?);
        let claude: Arc<dyn ModelProvider> = Arc::new(ClaudeProvider::new(
            &settings.anthropic_url,
            settings.max_tokens,
            settings.timeout,
        )?);
        let gemini: Arc<dyn ModelProvider> =
            Arc::new(GeminiProvider::new(&settings.gemini_url, settings.timeout)?);
        let custom: Option<Arc<dyn ModelProvider>> = match &settings.custom_url {
            Some(url) => Some(Arc::new(OpenAiProvider::new(
                "custom",
                url,
                settings.custom_model.clone(),
                settings.timeout,
            )?)),
            None => None,
        };

        let mut registry = Self::new(default_model);
        for info in Model::catalogue() {
            let provider = match info.kind {
                ProviderKind::OpenAi => Some(openai.clone()),
                ProviderKind::Anthropic => Some(claude.clone()),
                ProviderKind::Gemini => Some(gemini.clone()),
                ProviderKind::Custom => custom.clone(),
            };
            if let Some(provider) = provider {
                registry.register(info.model, provider);
            }
        }

        debug!("Provider registry ready with {} models", registry.providers.len());
        Ok(registry)
    }

    pub fn register(&mut self, model: Model, provider: Arc<dyn ModelProvider>) {
        self.providers.insert(model, provider);
    }

    pub fn default_model(&self) -> Model {
        self.default_model
    }

    pub fn is_registered(&self, model: Model) -> bool {
        self.providers.contains_key(&model)
    }

    /// Provider for `model`, falling back to the default model's provider
    pub fn resolve(&self, model: Model) -> Option<ResolvedProvider> {
        if let Some(provider) = self.providers.get(&model) {
            return Some(ResolvedProvider {
                provider: provider.clone(),
                model_id: model.info().internal_name.to_string(),
            });
        }

        warn!(
            "No provider registered for {}, falling back to {}",
            model, self.default_model
        );
        self.providers
            .get(&self.default_model)
            .map(|provider| ResolvedProvider {
                provider: provider.clone(),
                model_id: self.default_model.info().internal_name.to_string(),
            })
    }
}

/// Fold every system message into one block, keeping their order
pub(crate) fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.text.as_str())
        .collect();
    let rest = messages.iter().filter(|m| m.role != Role::System).collect();

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, rest)
}
