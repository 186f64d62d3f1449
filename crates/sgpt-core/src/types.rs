//! ============================================================================
//! Core Types for SGPT
//! ============================================================================
//! Defines the per-user record, conversation turns, memorized items and the
//! model catalogue. Records are persisted by the user store and mutated only
//! under the owning user's session lock.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Conversation
// ============================================================================

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat completion APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message exchanged in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    /// Unix timestamp
    pub timestamp: i64,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }
}

// ============================================================================
// Memory
// ============================================================================

/// A memorized document and the index chunks it was split into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    pub chunk_ids: Vec<String>,
    /// Unix timestamp
    pub created_at: i64,
}

impl MemoryRecord {
    pub fn new(memory_id: String, chunk_ids: Vec<String>) -> Self {
        Self {
            memory_id,
            chunk_ids,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

// ============================================================================
// Image settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImgQuality {
    #[default]
    Standard,
    Hd,
}

impl ImgQuality {
    pub fn toggled(self) -> Self {
        match self {
            ImgQuality::Standard => ImgQuality::Hd,
            ImgQuality::Hd => ImgQuality::Standard,
        }
    }

    pub fn api_value(&self) -> &'static str {
        match self {
            ImgQuality::Standard => "standard",
            ImgQuality::Hd => "hd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImgStyle {
    #[default]
    Natural,
    Vivid,
}

impl ImgStyle {
    pub fn toggled(self) -> Self {
        match self {
            ImgStyle::Natural => ImgStyle::Vivid,
            ImgStyle::Vivid => ImgStyle::Natural,
        }
    }

    pub fn api_value(&self) -> &'static str {
        match self {
            ImgStyle::Natural => "natural",
            ImgStyle::Vivid => "vivid",
        }
    }
}

// ============================================================================
// Model Catalogue
// ============================================================================

/// Completion backend family a model belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    /// OpenAI-compatible endpoint configured by the operator
    Custom,
}

/// Model selected by a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Model {
    #[default]
    Gpt3,
    Gpt4,
    Gpt4O,
    Claude3Haiku,
    Claude3Sonnet,
    Claude35Sonnet,
    Claude3Opus,
    Gemini15Pro,
    Custom,
}

/// Static description of a catalogue model
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub model: Model,
    /// Model id sent to the provider API
    pub internal_name: &'static str,
    pub pretty_name: &'static str,
    /// Lowercase names accepted by `/model`
    pub aliases: &'static [&'static str],
    pub kind: ProviderKind,
    pub description: &'static str,
}

const CATALOGUE: &[ModelInfo] = &[
    ModelInfo {
        model: Model::Gpt3,
        internal_name: "gpt-3.5-turbo",
        pretty_name: "GPT-3.5 Turbo",
        aliases: &["gpt3", "gpt3.5"],
        kind: ProviderKind::OpenAi,
        description: "Fast and cheap general purpose model",
    },
    ModelInfo {
        model: Model::Gpt4,
        internal_name: "gpt-4-turbo",
        pretty_name: "GPT-4 Turbo",
        aliases: &["gpt4"],
        kind: ProviderKind::OpenAi,
        description: "Strong reasoning, larger context",
    },
    ModelInfo {
        model: Model::Gpt4O,
        internal_name: "gpt-4o",
        pretty_name: "GPT-4o",
        aliases: &["gpt4o"],
        kind: ProviderKind::OpenAi,
        description: "Flagship multimodal OpenAI model",
    },
    ModelInfo {
        model: Model::Claude3Haiku,
        internal_name: "claude-3-haiku-20240307",
        pretty_name: "Claude 3 Haiku",
        aliases: &["claude3haiku", "haiku"],
        kind: ProviderKind::Anthropic,
        description: "Fastest Claude model",
    },
    ModelInfo {
        model: Model::Claude3Sonnet,
        internal_name: "claude-3-sonnet-20240229",
        pretty_name: "Claude 3 Sonnet",
        aliases: &["claude3sonnet", "sonnet"],
        kind: ProviderKind::Anthropic,
        description: "Balanced Claude model",
    },
    ModelInfo {
        model: Model::Claude35Sonnet,
        internal_name: "claude-3-5-sonnet-20240620",
        pretty_name: "Claude 3.5 Sonnet",
        aliases: &["claude35sonnet", "sonnet3.5"],
        kind: ProviderKind::Anthropic,
        description: "Most capable Sonnet",
    },
    ModelInfo {
        model: Model::Claude3Opus,
        internal_name: "claude-3-opus-20240229",
        pretty_name: "Claude 3 Opus",
        aliases: &["claude3opus", "opus"],
        kind: ProviderKind::Anthropic,
        description: "Largest Claude 3 model",
    },
    ModelInfo {
        model: Model::Gemini15Pro,
        internal_name: "gemini-1.5-pro",
        pretty_name: "Gemini 1.5 Pro",
        aliases: &["gemini15pro", "gemini"],
        kind: ProviderKind::Gemini,
        description: "Google long-context model",
    },
    ModelInfo {
        model: Model::Custom,
        internal_name: "custom",
        pretty_name: "Custom",
        aliases: &["custom"],
        kind: ProviderKind::Custom,
        description: "Operator-configured OpenAI-compatible endpoint",
    },
];

impl Model {
    /// Catalogue entry for this model
    pub fn info(&self) -> &'static ModelInfo {
        CATALOGUE
            .iter()
            .find(|info| info.model == *self)
            .unwrap_or(&CATALOGUE[0])
    }

    pub fn catalogue() -> &'static [ModelInfo] {
        CATALOGUE
    }

    pub fn kind(&self) -> ProviderKind {
        self.info().kind
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        CATALOGUE
            .iter()
            .find(|info| {
                info.aliases.contains(&wanted.as_str())
                    || format!("{:?}", info.model).to_lowercase() == wanted
            })
            .map(|info| info.model)
            .ok_or_else(|| format!("Unknown model: {}", s))
    }
}

// ============================================================================
// User Record
// ============================================================================

/// Identity fields supplied by the transport on every message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub first_name: String,
    pub last_name: String,
    pub user_name: String,
}

/// Durable per-user state. One record per end-user identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub user_name: String,
    /// Credential for the model provider (may be empty)
    pub api_key: String,
    pub model: Model,
    pub is_administrator: bool,
    pub is_blocked: bool,
    /// Ordered turns; a system turn, when present, is always first
    pub conversation: Vec<Turn>,
    /// Full memorized corpus
    pub memory_storage: Vec<MemoryRecord>,
    /// Memory ids currently in scope for recall
    pub working_memory: Vec<String>,
    pub voice_mode: bool,
    pub img_quality: ImgQuality,
    pub img_style: ImgStyle,
    /// Restrict recall to `working_memory`
    pub context_filter: bool,
    pub created_at: i64,
    pub last_activity: i64,
}

impl UserRecord {
    pub fn new(id: i64, profile: &ProfileFields, is_administrator: bool) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            user_name: profile.user_name.clone(),
            api_key: String::new(),
            model: Model::default(),
            is_administrator,
            is_blocked: false,
            conversation: Vec::new(),
            memory_storage: Vec::new(),
            working_memory: Vec::new(),
            voice_mode: false,
            img_quality: ImgQuality::default(),
            img_style: ImgStyle::default(),
            context_filter: true,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if !self.user_name.is_empty() {
            format!("{} (@{})", full, self.user_name)
        } else {
            full.to_string()
        }
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now().timestamp();
    }

    // ------------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------------

    /// Active context prompt, if any
    pub fn system_prompt(&self) -> Option<&str> {
        self.conversation
            .iter()
            .find(|turn| turn.role == Role::System)
            .map(|turn| turn.text.as_str())
    }

    /// Replace the context prompt. The new system turn goes to the head.
    pub fn set_system_prompt(&mut self, text: impl Into<String>) {
        self.clear_system_prompt();
        self.conversation.insert(0, Turn::system(text));
    }

    /// Returns true when a system turn was removed
    pub fn clear_system_prompt(&mut self) -> bool {
        let before = self.conversation.len();
        self.conversation.retain(|turn| turn.role != Role::System);
        before != self.conversation.len()
    }

    /// Drop every non-system turn
    pub fn clear_conversation(&mut self) {
        self.conversation.retain(|turn| turn.role == Role::System);
    }

    /// Non-system turns in order
    pub fn history(&self) -> impl Iterator<Item = &Turn> {
        self.conversation
            .iter()
            .filter(|turn| turn.role != Role::System)
    }

    pub fn user_turn_count(&self) -> usize {
        self.conversation
            .iter()
            .filter(|turn| turn.role == Role::User)
            .count()
    }

    pub fn push_exchange(&mut self, user_text: impl Into<String>, assistant_text: impl Into<String>) {
        self.conversation.push(Turn::user(user_text));
        self.conversation.push(Turn::assistant(assistant_text));
    }

    /// Clear the conversation when the user-turn count exceeds `threshold`.
    /// Returns true when the reset happened.
    pub fn enforce_turn_limit(&mut self, threshold: usize) -> bool {
        if self.user_turn_count() > threshold {
            self.clear_conversation();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    pub fn memory_ids(&self) -> HashSet<String> {
        self.memory_storage
            .iter()
            .map(|item| item.memory_id.clone())
            .collect()
    }

    pub fn find_memory(&self, memory_id: &str) -> Option<&MemoryRecord> {
        self.memory_storage
            .iter()
            .find(|item| item.memory_id == memory_id)
    }

    pub fn is_working(&self, memory_id: &str) -> bool {
        self.working_memory.iter().any(|id| id == memory_id)
    }

    /// Store a memorized item, optionally placing it in the working set
    pub fn add_memory(&mut self, record: MemoryRecord, into_working: bool) {
        if into_working && !self.is_working(&record.memory_id) {
            self.working_memory.push(record.memory_id.clone());
        }
        self.memory_storage.push(record);
    }

    /// Remove an item from both storage and the working set
    pub fn remove_memory(&mut self, memory_id: &str) -> Option<MemoryRecord> {
        let position = self
            .memory_storage
            .iter()
            .position(|item| item.memory_id == memory_id)?;
        self.working_memory.retain(|id| id != memory_id);
        Some(self.memory_storage.remove(position))
    }

    /// Remove everything memorized, returning what was removed
    pub fn clear_memory(&mut self) -> Vec<MemoryRecord> {
        self.working_memory.clear();
        std::mem::take(&mut self.memory_storage)
    }

    /// Flip an item in or out of the working set. Returns the new membership,
    /// or None when the id is not memorized.
    pub fn toggle_working(&mut self, memory_id: &str) -> Option<bool> {
        self.find_memory(memory_id)?;
        if self.is_working(memory_id) {
            self.working_memory.retain(|id| id != memory_id);
            Some(false)
        } else {
            self.working_memory.push(memory_id.to_string());
            Some(true)
        }
    }

    /// Candidate memory ids for recall, None when recall is unrestricted
    pub fn recall_scope(&self) -> Option<HashSet<String>> {
        if self.context_filter {
            Some(self.working_memory.iter().cloned().collect())
        } else {
            None
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure classes surfaced by the session dispatcher. Every variant is
/// converted into a reply; none terminates the dispatcher.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BotError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("{0}")]
    Provider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UserRecord {
        UserRecord::new(1, &ProfileFields::default(), false)
    }

    #[test]
    fn test_single_system_turn() {
        let mut user = record();
        user.push_exchange("hi", "hello");
        user.set_system_prompt("be brief");
        user.set_system_prompt("be verbose");

        let systems: Vec<_> = user
            .conversation
            .iter()
            .filter(|t| t.role == Role::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(user.conversation[0].text, "be verbose");
        assert_eq!(user.system_prompt(), Some("be verbose"));
    }

    #[test]
    fn test_turn_limit_preserves_system() {
        let mut user = record();
        user.set_system_prompt("ctx");
        for i in 0..3 {
            user.push_exchange(format!("q{}", i), format!("a{}", i));
        }
        assert!(!user.enforce_turn_limit(3));
        user.push_exchange("q3", "a3");
        assert!(user.enforce_turn_limit(3));
        assert_eq!(user.conversation.len(), 1);
        assert_eq!(user.system_prompt(), Some("ctx"));
    }

    #[test]
    fn test_working_memory_subset() {
        let mut user = record();
        user.add_memory(MemoryRecord::new("a.txt".into(), vec!["c1".into()]), true);
        user.add_memory(MemoryRecord::new("b.txt".into(), vec!["c2".into()]), false);
        assert_eq!(user.working_memory, vec!["a.txt".to_string()]);

        assert_eq!(user.toggle_working("b.txt"), Some(true));
        assert_eq!(user.toggle_working("missing"), None);

        user.remove_memory("a.txt");
        assert_eq!(user.working_memory, vec!["b.txt".to_string()]);
        assert!(user
            .working_memory
            .iter()
            .all(|id| user.find_memory(id).is_some()));

        user.clear_memory();
        assert!(user.memory_storage.is_empty());
        assert!(user.working_memory.is_empty());
    }

    #[test]
    fn test_model_parsing_and_display() {
        assert_eq!("gpt4".parse::<Model>(), Ok(Model::Gpt4));
        assert_eq!("GPT3.5".parse::<Model>(), Ok(Model::Gpt3));
        assert_eq!("claude35sonnet".parse::<Model>(), Ok(Model::Claude35Sonnet));
        assert!("llama".parse::<Model>().is_err());
        assert_eq!(Model::Gpt4.to_string(), "Gpt4");
        assert_eq!(Model::Gemini15Pro.kind(), ProviderKind::Gemini);
    }

    #[test]
    fn test_recall_scope_follows_filter() {
        let mut user = record();
        user.add_memory(MemoryRecord::new("notes".into(), vec![]), true);
        assert_eq!(
            user.recall_scope(),
            Some(["notes".to_string()].into_iter().collect())
        );
        user.context_filter = false;
        assert_eq!(user.recall_scope(), None);
    }
}
