//! ============================================================================
//! Bot Configuration - Environment-driven settings
//! ============================================================================
//! Every option has a default except the transport token. A `.env` file in
//! the working directory is loaded first when present.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::chunker::ChunkSettings;
use crate::memory::{RecallSettings, DEFAULT_EMBEDDINGS_URL, DEFAULT_EMBEDDING_MODEL};
use crate::provider::ProviderSettings;
use crate::speech::DEFAULT_TTS_URL;
use crate::types::Model;

/// Default number of user turns kept before the conversation resets
pub const DEFAULT_RESET_THRESHOLD: usize = 25;

/// Default character budget for replayed history
pub const DEFAULT_CONTEXT_BUDGET_CHARS: usize = 24_000;

pub const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";

/// Where memorized text is indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBackend {
    Qdrant,
    /// Process-local index, lost on restart
    InMemory,
}

impl FromStr for MemoryBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "qdrant" => Ok(MemoryBackend::Qdrant),
            "memory" | "in-memory" | "in_memory" => Ok(MemoryBackend::InMemory),
            _ => Err(format!("Unknown memory backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: Option<String>,
    pub admin_id: Option<i64>,
    /// None admits everyone
    pub allowed_ids: Option<HashSet<i64>>,
    pub new_users_blocked: bool,
    pub default_model: Model,
    pub reset_threshold: usize,
    pub context_budget_chars: usize,
    pub chunking: ChunkSettings,
    pub recall: RecallSettings,
    pub memory_backend: MemoryBackend,
    pub qdrant_url: String,
    pub embeddings_url: String,
    pub embeddings_model: String,
    pub tts_url: String,
    /// Text extraction service for messages starting with a link; None disables it
    pub transcript_url: Option<String>,
    pub db_path: Option<String>,
    pub providers: ProviderSettings,
    pub model_timeout: Duration,
    pub speech_timeout: Duration,
    pub transcript_timeout: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            admin_id: None,
            allowed_ids: None,
            new_users_blocked: false,
            default_model: Model::default(),
            reset_threshold: DEFAULT_RESET_THRESHOLD,
            context_budget_chars: DEFAULT_CONTEXT_BUDGET_CHARS,
            chunking: ChunkSettings::default(),
            recall: RecallSettings::default(),
            memory_backend: MemoryBackend::Qdrant,
            qdrant_url: DEFAULT_QDRANT_URL.to_string(),
            embeddings_url: DEFAULT_EMBEDDINGS_URL.to_string(),
            embeddings_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            tts_url: DEFAULT_TTS_URL.to_string(),
            transcript_url: None,
            db_path: None,
            providers: ProviderSettings::default(),
            model_timeout: Duration::from_secs(120),
            speech_timeout: Duration::from_secs(30),
            transcript_timeout: Duration::from_secs(300),
        }
    }
}

impl BotConfig {
    /// Load `.env` (if any) and read the process environment
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Could not load .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or blank keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        config.telegram_token = get("TELEGRAM_BOT_TOKEN");
        config.admin_id = parse_opt(&get, "SGPT_ADMIN_ID")?;
        config.allowed_ids = match get("SGPT_ALLOWED_IDS") {
            Some(list) => Some(parse_id_list(&list)?),
            None => None,
        };
        if let Some(blocked) = get("SGPT_NEW_USERS_BLOCKED") {
            config.new_users_blocked = parse_bool(&blocked)
                .ok_or_else(|| anyhow!("Invalid SGPT_NEW_USERS_BLOCKED: {}", blocked))?;
        }
        if let Some(model) = get("SGPT_DEFAULT_MODEL") {
            config.default_model = model
                .parse()
                .map_err(|e| anyhow!("Invalid SGPT_DEFAULT_MODEL: {}", e))?;
        }

        set(&mut config.reset_threshold, parse_opt(&get, "SGPT_RESET_THRESHOLD")?);
        set(&mut config.context_budget_chars, parse_opt(&get, "SGPT_CONTEXT_BUDGET_CHARS")?);
        set(&mut config.recall.limit, parse_opt(&get, "SGPT_RECALL_LIMIT")?);
        set(&mut config.recall.min_relevance, parse_opt(&get, "SGPT_MIN_RELEVANCE")?);
        set(&mut config.recall.cache_duration_secs, parse_opt(&get, "SGPT_RECALL_CACHE_SECS")?);
        set(&mut config.chunking.max_units_per_line, parse_opt(&get, "MAX_TOKENS_PER_LINE")?);
        set(&mut config.chunking.max_units_per_paragraph, parse_opt(&get, "MAX_TOKENS_PER_PARAGRAPH")?);
        set(&mut config.chunking.overlap_units, parse_opt(&get, "OVERLAP_TOKENS")?);

        if let Some(backend) = get("SGPT_MEMORY_BACKEND") {
            config.memory_backend = backend.parse().map_err(|e: String| anyhow!(e))?;
        }
        set(&mut config.qdrant_url, get("QDRANT_URL"));
        set(&mut config.embeddings_url, get("SGPT_EMBEDDINGS_URL"));
        set(&mut config.embeddings_model, get("SGPT_EMBEDDINGS_MODEL"));
        set(&mut config.tts_url, get("SGPT_TTS_URL"));
        config.transcript_url = get("SGPT_TRANSCRIPT_URL");
        config.db_path = get("SGPT_DB_PATH");

        set(&mut config.providers.openai_url, get("SGPT_OPENAI_URL"));
        set(&mut config.providers.anthropic_url, get("SGPT_ANTHROPIC_URL"));
        set(&mut config.providers.gemini_url, get("SGPT_GEMINI_URL"));
        config.providers.custom_url = get("SGPT_CUSTOM_URL");
        config.providers.custom_model = get("SGPT_CUSTOM_MODEL");
        set(&mut config.providers.max_tokens, parse_opt(&get, "SGPT_MAX_TOKENS")?);

        if let Some(secs) = parse_opt::<u64>(&get, "SGPT_MODEL_TIMEOUT_SECS")? {
            config.model_timeout = Duration::from_secs(secs);
            config.providers.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_opt::<u64>(&get, "SGPT_RECALL_TIMEOUT_SECS")? {
            config.recall.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_opt::<u64>(&get, "SGPT_SPEECH_TIMEOUT_SECS")? {
            config.speech_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_opt::<u64>(&get, "SGPT_TRANSCRIPT_TIMEOUT_SECS")? {
            config.transcript_timeout = Duration::from_secs(secs);
        }

        if config.reset_threshold == 0 {
            return Err(anyhow!("SGPT_RESET_THRESHOLD must be at least 1"));
        }
        if !(0.0..=1.0).contains(&config.recall.min_relevance) {
            return Err(anyhow!("SGPT_MIN_RELEVANCE must be between 0 and 1"));
        }

        Ok(config)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_opt<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {} '{}': {}", key, raw, e)),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_id_list(raw: &str) -> Result<HashSet<i64>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|e| anyhow!("Invalid id '{}' in SGPT_ALLOWED_IDS: {}", part, e))
        })
        .collect()
}
