//! ============================================================================
//! Session Module - Turns inbound messages into replies
//! ============================================================================
//! `SessionDispatcher::handle` is the single entry point for every message:
//!
//! 1. Allow-list check (nothing is created for rejected ids)
//! 2. Per-user lock, load or create the record
//! 3. Blocked and administrator gates
//! 4. Command handlers or the conversational turn
//!
//! Handlers work on a copy of the record and persist it once. A failed
//! persist discards the change. No error escapes `handle`; each one becomes
//! a reply.
//! ============================================================================

mod command;
mod locks;
mod prompt;
pub mod replies;

pub use command::Command;
pub use locks::UserLocks;
pub use prompt::assemble;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::access::AccessGate;
use crate::chunker::ChunkSettings;
use crate::chunker::chunk_text;
use crate::config::{BotConfig, MemoryBackend};
use crate::db::{RedbUserStore, StoreError, UserStore};
use crate::links::{leading_url, LinkExpander, TranscriptService};
use crate::memory::{
    EmbeddingService, InMemoryIndex, MemorizeRequest, MemoryError, MemoryIndex, MemoryRecall,
    QdrantIndex, VectorIndex,
};
use crate::provider::{
    ChatMessage, CompletionRequest, ImageGenerator, OpenAiImageGenerator, ProviderError,
    ProviderRegistry,
};
use crate::speech::{OpenAiSpeech, SpeechSynthesizer};
use crate::types::{BotError, Model, ProfileFields, Role, UserRecord};

/// Instruction applied to each paragraph by `/summarize`
const SUMMARY_PROMPT: &str =
    "Create a summary (using a simple vocabulary) capturing the main points and key details of:";

use replies::{
    EMPTY_RESPONSE_MESSAGE, LOAD_FAILED_MESSAGE, NO_KEY_MESSAGE, RESET_NOTICE, SAVE_FAILED_MESSAGE,
};

// ============================================================================
// Messages
// ============================================================================

/// One message from a chat transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub user_id: i64,
    /// Transport message id, echoed as `reply_to`
    pub message_id: Option<i64>,
    pub profile: ProfileFields,
    pub text: String,
}

impl InboundMessage {
    pub fn new(user_id: i64, text: impl Into<String>) -> Self {
        Self {
            user_id,
            message_id: None,
            profile: ProfileFields::default(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// Opus voice note
    Voice(Vec<u8>),
    Image(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub user_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    pub attachments: Vec<Attachment>,
}

impl Reply {
    fn text(message: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            user_id: message.user_id,
            text: text.into(),
            reply_to: message.message_id,
            attachments: Vec::new(),
        }
    }
}

/// What a handler produced before it is addressed to the user
struct Response {
    text: String,
    attachments: Vec<Attachment>,
    follow_up: Option<String>,
}

impl Response {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            follow_up: None,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Conversation is cleared once it holds more user turns than this
    pub reset_threshold: usize,
    pub context_budget_chars: usize,
    pub chunking: ChunkSettings,
    pub model_timeout: Duration,
    pub speech_timeout: Duration,
    pub transcript_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&BotConfig::default())
    }
}

impl From<&BotConfig> for SessionSettings {
    fn from(config: &BotConfig) -> Self {
        Self {
            reset_threshold: config.reset_threshold,
            context_budget_chars: config.context_budget_chars,
            chunking: config.chunking,
            model_timeout: config.model_timeout,
            speech_timeout: config.speech_timeout,
            transcript_timeout: config.transcript_timeout,
        }
    }
}

pub struct SessionDispatcher {
    store: Arc<dyn UserStore>,
    gate: AccessGate,
    providers: ProviderRegistry,
    index: MemoryIndex,
    recall: MemoryRecall,
    images: Option<Arc<dyn ImageGenerator>>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    links: Option<Arc<dyn LinkExpander>>,
    locks: UserLocks,
    settings: SessionSettings,
}

fn persistence(e: StoreError) -> BotError {
    BotError::Persistence(e.to_string())
}

impl SessionDispatcher {
    pub fn new(
        store: Arc<dyn UserStore>,
        gate: AccessGate,
        providers: ProviderRegistry,
        index: MemoryIndex,
        recall: MemoryRecall,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            gate,
            providers,
            index,
            recall,
            images: None,
            speech: None,
            links: None,
            locks: UserLocks::new(),
            settings,
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageGenerator>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechSynthesizer>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_links(mut self, links: Arc<dyn LinkExpander>) -> Self {
        self.links = Some(links);
        self
    }

    /// Wire every backend from configuration
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let store: Arc<dyn UserStore> = Arc::new(RedbUserStore::open(config.db_path.as_deref())?);

        let embedder = Arc::new(EmbeddingService::new(
            config.embeddings_url.clone(),
            config.embeddings_model.clone(),
            config.model_timeout,
        )?);
        let vectors: Arc<dyn VectorIndex> = match config.memory_backend {
            MemoryBackend::Qdrant => Arc::new(QdrantIndex::new(&config.qdrant_url)?),
            MemoryBackend::InMemory => {
                warn!("Using in-memory vector index, memorized text is lost on restart");
                Arc::new(InMemoryIndex::new())
            }
        };

        let providers = ProviderRegistry::with_defaults(&config.providers, config.default_model)?;
        let images = Arc::new(OpenAiImageGenerator::new(
            &config.providers.openai_url,
            config.model_timeout,
        )?);
        let speech = Arc::new(OpenAiSpeech::new(&config.tts_url, config.speech_timeout)?);

        let gate = AccessGate::new(
            config.admin_id,
            config.allowed_ids.clone(),
            config.new_users_blocked,
        );

        info!(
            "Session dispatcher ready (default model {}, memory backend {:?})",
            config.default_model, config.memory_backend
        );

        let dispatcher = Self::new(
            store,
            gate,
            providers,
            MemoryIndex::new(embedder.clone(), vectors.clone()),
            MemoryRecall::new(embedder, vectors, config.recall.clone()),
            SessionSettings::from(config),
        )
        .with_images(images)
        .with_speech(speech);

        Ok(match &config.transcript_url {
            Some(url) => {
                info!("Link expansion enabled via {}", url);
                let links = TranscriptService::new(url, config.transcript_timeout)?;
                dispatcher.with_links(Arc::new(links))
            }
            None => dispatcher,
        })
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Process one inbound message. Returns one reply, or two when the
    /// conversation was reset by the turn limit.
    pub async fn handle(&self, message: InboundMessage) -> Vec<Reply> {
        let user_id = message.user_id;

        if let Err(e) = self.gate.check_allowed(user_id) {
            return vec![Reply::text(&message, e.to_string())];
        }

        let command = Command::parse(&message.text);
        debug!("User {} sent /{}", user_id, command.name());

        let guard = self.locks.acquire(user_id).await;

        let user = match self.load(&message).await {
            Ok(user) => user,
            Err(e) => {
                error!("Failed to load user {}: {}", user_id, e);
                return vec![Reply::text(&message, LOAD_FAILED_MESSAGE)];
            }
        };

        let outcome = match self.authorize(&user, &command) {
            Err(e) => Err(e),
            // The caller's lock is released before the target's is taken
            Ok(()) => match command {
                Command::Allow(arg) => {
                    drop(guard);
                    self.set_blocked(arg, false).await
                }
                Command::Deny(arg) => {
                    drop(guard);
                    self.set_blocked(arg, true).await
                }
                command => {
                    let outcome = self.execute(command, user).await;
                    drop(guard);
                    outcome
                }
            },
        };

        match outcome {
            Ok(response) => {
                let mut replies = vec![Reply {
                    user_id,
                    text: response.text,
                    reply_to: message.message_id,
                    attachments: response.attachments,
                }];
                if let Some(follow_up) = response.follow_up {
                    replies.push(Reply::text(&message, follow_up));
                }
                replies
            }
            Err(BotError::Persistence(reason)) => {
                error!("Failed to persist user {}: {}", user_id, reason);
                vec![Reply::text(&message, SAVE_FAILED_MESSAGE)]
            }
            Err(e) => vec![Reply::text(&message, e.to_string())],
        }
    }

    async fn load(&self, message: &InboundMessage) -> Result<UserRecord, StoreError> {
        let is_admin = self.gate.is_admin(message.user_id);
        let mut seed = UserRecord::new(message.user_id, &message.profile, is_admin);
        seed.is_blocked = self.gate.starts_blocked(message.user_id);

        let mut user = self.store.get_or_create(seed).await?;
        // The configured id is authoritative; a changed SGPT_ADMIN_ID demotes
        user.is_administrator = is_admin;

        // Transports that omit the profile leave the stored names alone
        let profile = &message.profile;
        if !profile.first_name.is_empty() || !profile.user_name.is_empty() {
            user.first_name = profile.first_name.clone();
            user.last_name = profile.last_name.clone();
            user.user_name = profile.user_name.clone();
        }
        Ok(user)
    }

    fn authorize(&self, user: &UserRecord, command: &Command) -> Result<(), BotError> {
        self.gate.check_not_blocked(user, command.is_informational())?;
        if command.is_admin_only() {
            self.gate.require_admin(user)?;
        }
        Ok(())
    }

    async fn persist(&self, mut user: UserRecord) -> Result<UserRecord, BotError> {
        user.touch();
        self.store.update(&user).await.map_err(persistence)?;
        Ok(user)
    }

    async fn execute(&self, command: Command, mut user: UserRecord) -> Result<Response, BotError> {
        match command {
            Command::Talk(text) => self.talk(user, text).await,

            Command::Reset => {
                user.clear_conversation();
                self.persist(user).await?;
                Ok(Response::text("Current conversation was reset."))
            }

            Command::Key(None) => Err(BotError::Validation(
                "After '/key' command you must input your API key. Try again.".into(),
            )),
            Command::Key(Some(key)) => {
                user.api_key = key;
                self.persist(user).await?;
                Ok(Response::text("API key was set."))
            }

            Command::Model(name) => self.set_model(user, name).await,

            Command::Context(None) => Err(BotError::Validation(
                "After the '/context' command you must input the context (system) prompt. Try again."
                    .into(),
            )),
            Command::Context(Some(prompt)) => {
                user.set_system_prompt(prompt);
                self.persist(user).await?;
                Ok(Response::text("Context prompt was set."))
            }
            Command::ResetContext => {
                user.clear_system_prompt();
                self.persist(user).await?;
                Ok(Response::text("Context prompt was deleted."))
            }

            Command::ToggleVoice => {
                user.voice_mode = !user.voice_mode;
                let user = self.persist(user).await?;
                Ok(Response::text(if user.voice_mode {
                    "Voice mode is on."
                } else {
                    "Voice mode is off."
                }))
            }
            Command::ToggleImgQuality => {
                user.img_quality = user.img_quality.toggled();
                let user = self.persist(user).await?;
                Ok(Response::text(format!(
                    "Image quality set to {}.",
                    user.img_quality.api_value()
                )))
            }
            Command::ToggleImgStyle => {
                user.img_style = user.img_style.toggled();
                let user = self.persist(user).await?;
                Ok(Response::text(format!(
                    "Image style set to {}.",
                    user.img_style.api_value()
                )))
            }
            Command::Image(prompt) => self.image(&user, prompt).await,
            Command::Summarize(arg) => self.summarize(&user, arg).await,

            Command::Users => match self.store.list_all().await {
                Ok(mut all) => {
                    for record in &mut all {
                        record.is_administrator = self.gate.is_admin(record.id);
                    }
                    Ok(Response::text(replies::users(&all)))
                }
                Err(e) => {
                    error!("Failed to list users: {}", e);
                    Ok(Response::text(LOAD_FAILED_MESSAGE))
                }
            },
            Command::Usage => Ok(Response::text(replies::usage(self.gate.is_admin(user.id)))),
            Command::Info => Ok(Response::text(replies::info(&user))),
            Command::About => Ok(Response::text(replies::ABOUT_TEXT)),
            Command::History => Ok(Response::text(replies::history(&user))),

            Command::Memorize(arg) => self.memorize(user, arg).await,
            Command::Memories => Ok(Response::text(replies::memories(&user))),
            Command::Forget(arg) => self.forget(user, arg).await,
            Command::ForgetAll => self.forget_all(user).await,
            Command::Focus(arg) => self.focus(user, arg).await,
            Command::ToggleContextFilter => {
                user.context_filter = !user.context_filter;
                let user = self.persist(user).await?;
                Ok(Response::text(if user.context_filter {
                    "Context filter is on. Recall searches working memory only."
                } else {
                    "Context filter is off. Recall searches every memorized item."
                }))
            }

            // Routed before execute, after the caller's lock is released
            Command::Allow(_) | Command::Deny(_) => Err(BotError::Validation(
                "Command is not available here.".into(),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------------

    async fn talk(&self, mut user: UserRecord, text: String) -> Result<Response, BotError> {
        if !user.has_credential() {
            return Err(BotError::Validation(NO_KEY_MESSAGE.into()));
        }
        let text = self.expand_link(&user, text).await;

        let resolved = self.providers.resolve(user.model).ok_or_else(|| {
            BotError::Provider(ProviderError::Unavailable(user.model.to_string()).to_string())
        })?;

        let scope = user.recall_scope();
        let fragments = self
            .recall
            .recall(&user.api_key, user.id, &text, scope.as_ref())
            .await;
        if !fragments.is_empty() {
            debug!("Recalled {} fragment(s) for user {}", fragments.len(), user.id);
        }

        let request = CompletionRequest {
            credential: user.api_key.clone(),
            model_id: resolved.model_id,
            messages: prompt::assemble(&user, &fragments, &text, self.settings.context_budget_chars),
        };

        let answer = match timeout(self.settings.model_timeout, resolved.provider.complete(&request)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!("{} failed for user {}: {}", resolved.provider.name(), user.id, e);
                return Err(BotError::Provider(e.to_string()));
            }
            Err(_) => {
                let secs = self.settings.model_timeout.as_secs();
                warn!("{} timed out for user {}", resolved.provider.name(), user.id);
                return Err(BotError::Provider(ProviderError::Timeout(secs).to_string()));
            }
        };

        if answer.trim().is_empty() {
            return Err(BotError::Provider(EMPTY_RESPONSE_MESSAGE.into()));
        }

        user.push_exchange(text, answer.clone());
        let reset = user.enforce_turn_limit(self.settings.reset_threshold);
        if reset {
            info!("Conversation of user {} reached the turn limit and was reset", user.id);
        }
        let user = self.persist(user).await?;

        let attachments = if user.voice_mode {
            self.voice(&user.api_key, &answer).await.into_iter().collect()
        } else {
            Vec::new()
        };

        Ok(Response {
            text: answer,
            attachments,
            follow_up: reset.then(|| RESET_NOTICE.to_string()),
        })
    }

    /// Swap a message that starts with a link for the text behind it.
    /// Any failure keeps the message as typed.
    async fn expand_link(&self, user: &UserRecord, text: String) -> String {
        let (Some(links), Some(url)) = (self.links.as_ref(), leading_url(&text)) else {
            return text;
        };

        match timeout(self.settings.transcript_timeout, links.fetch_text(&user.api_key, url)).await {
            Ok(Ok(fetched)) if !fetched.trim().is_empty() => {
                info!("Expanded link for user {} ({} chars)", user.id, fetched.len());
                fetched
            }
            Ok(Ok(_)) => text,
            Ok(Err(e)) => {
                warn!("Link expansion failed for user {}: {}", user.id, e);
                text
            }
            Err(_) => {
                warn!("Link expansion timed out for user {}", user.id);
                text
            }
        }
    }

    /// Chunk the text and summarize every paragraph concurrently, in order.
    /// Nothing is persisted.
    async fn summarize(&self, user: &UserRecord, arg: Option<String>) -> Result<Response, BotError> {
        let text = arg.ok_or_else(|| {
            BotError::Validation(
                "After '/summarize' command you must input a text or a link. Try again.".into(),
            )
        })?;
        if !user.has_credential() {
            return Err(BotError::Validation(NO_KEY_MESSAGE.into()));
        }
        let resolved = self.providers.resolve(user.model).ok_or_else(|| {
            BotError::Provider(ProviderError::Unavailable(user.model.to_string()).to_string())
        })?;

        let text = self.expand_link(user, text).await;
        let paragraphs = chunk_text(&text, &self.settings.chunking);
        info!("Summarizing {} paragraph(s) for user {}", paragraphs.len(), user.id);

        let mut tasks = tokio::task::JoinSet::new();
        for (position, paragraph) in paragraphs.into_iter().enumerate() {
            let provider = resolved.provider.clone();
            let request = CompletionRequest {
                credential: user.api_key.clone(),
                model_id: resolved.model_id.clone(),
                messages: vec![ChatMessage::new(
                    Role::User,
                    format!("{}\n\n{}", SUMMARY_PROMPT, paragraph),
                )],
            };
            let limit = self.settings.model_timeout;
            tasks.spawn(async move {
                let summary = match timeout(limit, provider.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout(limit.as_secs())),
                };
                (position, summary)
            });
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (position, summary) =
                joined.map_err(|e| BotError::Provider(format!("Summary task failed: {}", e)))?;
            match summary {
                Ok(summary) => summaries.push((position, summary.trim().to_string())),
                Err(e) => {
                    warn!("Summary failed for user {}: {}", user.id, e);
                    return Err(BotError::Provider(e.to_string()));
                }
            }
        }
        summaries.sort_by_key(|(position, _)| *position);

        let summary = summaries
            .into_iter()
            .map(|(_, summary)| summary)
            .filter(|summary| !summary.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if summary.is_empty() {
            return Err(BotError::Provider(EMPTY_RESPONSE_MESSAGE.into()));
        }
        Ok(Response::text(summary))
    }

    /// Voice note for an answer; None means the text reply is used alone
    async fn voice(&self, credential: &str, text: &str) -> Option<Attachment> {
        let speech = self.speech.as_ref()?;
        match timeout(self.settings.speech_timeout, speech.synthesize(credential, text)).await {
            Ok(Ok(audio)) => Some(Attachment::Voice(audio)),
            Ok(Err(e)) => {
                warn!("Speech synthesis failed, replying with text: {}", e);
                None
            }
            Err(_) => {
                warn!("Speech synthesis timed out, replying with text");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    async fn set_model(&self, mut user: UserRecord, name: Option<String>) -> Result<Response, BotError> {
        let model: Model = name
            .as_deref()
            .and_then(|name| name.parse().ok())
            .ok_or_else(|| BotError::Validation(replies::model_usage()))?;

        if !self.providers.is_registered(model) {
            return Err(BotError::Validation(format!(
                "Model '{}' is not available on this bot.",
                model
            )));
        }

        user.model = model;
        self.persist(user).await?;
        Ok(Response::text(format!("Model '{}' was set.", model)))
    }

    async fn image(&self, user: &UserRecord, prompt: Option<String>) -> Result<Response, BotError> {
        let prompt = prompt.ok_or_else(|| {
            BotError::Validation(
                "After '/image' command you must input the image description. Try again.".into(),
            )
        })?;
        if !user.has_credential() {
            return Err(BotError::Validation(NO_KEY_MESSAGE.into()));
        }
        let images = self
            .images
            .as_ref()
            .ok_or_else(|| BotError::Validation("Image generation is not available.".into()))?;

        let generated = timeout(
            self.settings.model_timeout,
            images.generate(&user.api_key, &prompt, user.img_quality, user.img_style),
        )
        .await;

        match generated {
            Ok(Ok(bytes)) => Ok(Response {
                text: prompt,
                attachments: vec![Attachment::Image(bytes)],
                follow_up: None,
            }),
            Ok(Err(e)) => {
                warn!("Image generation failed for user {}: {}", user.id, e);
                Err(BotError::Provider(e.to_string()))
            }
            Err(_) => Err(BotError::Provider(
                ProviderError::Timeout(self.settings.model_timeout.as_secs()).to_string(),
            )),
        }
    }

    /// `/allow` and `/deny`. Runs under the target's lock only.
    async fn set_blocked(&self, arg: Option<String>, blocked: bool) -> Result<Response, BotError> {
        let command = if blocked { "deny" } else { "allow" };
        let target_id: i64 = arg
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                BotError::Validation(format!(
                    "After '/{}' command you must input the user id. Try again.",
                    command
                ))
            })?;

        let _guard = self.locks.acquire(target_id).await;

        let Some(mut target) = self.store.get_by_id(target_id).await.map_err(persistence)? else {
            return Ok(Response::text(format!("User {} was not found.", target_id)));
        };

        if blocked && self.gate.is_admin(target_id) {
            return Err(BotError::Validation("Administrators cannot be blocked.".into()));
        }

        target.is_blocked = blocked;
        target.is_administrator = self.gate.is_admin(target_id);
        self.store.update(&target).await.map_err(persistence)?;
        info!("User {} was {}", target_id, if blocked { "blocked" } else { "allowed" });

        Ok(Response::text(format!(
            "User {} was {}.",
            target_id,
            if blocked { "blocked" } else { "allowed" }
        )))
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    async fn memorize(&self, mut user: UserRecord, arg: Option<String>) -> Result<Response, BotError> {
        let usage = || {
            BotError::Validation(
                "After '/memorize' command you must input a memory id and the text. Try again."
                    .into(),
            )
        };
        let arg = arg.ok_or_else(usage)?;
        let (memory_id, text) = arg
            .split_once(char::is_whitespace)
            .map(|(id, text)| (id, text.trim()))
            .filter(|(_, text)| !text.is_empty())
            .ok_or_else(usage)?;

        if !user.has_credential() {
            return Err(BotError::Validation(NO_KEY_MESSAGE.into()));
        }

        let taken = user.memory_ids();
        let memorized = self
            .index
            .memorize(MemorizeRequest {
                credential: &user.api_key,
                user_id: user.id,
                memory_id,
                text,
                taken: &taken,
                chunking: self.settings.chunking,
            })
            .await;

        let record = match memorized {
            Ok(record) => record,
            Err(MemoryError::Partial {
                memory_id,
                stored_chunk_ids,
                reason,
            }) => {
                self.discard_chunks(user.id, &stored_chunk_ids).await;
                return Err(BotError::Provider(format!(
                    "Could not memorize '{}': {}",
                    memory_id, reason
                )));
            }
            Err(e @ (MemoryError::EmptyText | MemoryError::EmptyMemoryId)) => {
                return Err(BotError::Validation(e.to_string()));
            }
            Err(e) => return Err(BotError::Provider(format!("Could not memorize: {}", e))),
        };

        let user_id = user.id;
        let stored_id = record.memory_id.clone();
        let chunk_ids = record.chunk_ids.clone();
        user.add_memory(record, true);
        if let Err(e) = self.persist(user).await {
            self.discard_chunks(user_id, &chunk_ids).await;
            return Err(e);
        }
        self.recall.invalidate_user(user_id).await;
        Ok(Response::text(format!(
            "Memorized '{}' ({} chunk(s)).",
            stored_id,
            chunk_ids.len()
        )))
    }

    /// Best-effort removal of chunks that no record will reference
    async fn discard_chunks(&self, user_id: i64, chunk_ids: &[String]) {
        if let Err(e) = self.index.delete_chunks(user_id, chunk_ids).await {
            warn!(
                "Could not remove {} orphaned chunk(s) for user {}: {}",
                chunk_ids.len(),
                user_id,
                e
            );
        }
    }

    async fn forget(&self, mut user: UserRecord, arg: Option<String>) -> Result<Response, BotError> {
        let memory_id = arg.ok_or_else(|| {
            BotError::Validation("After '/forget' command you must input the memory id. Try again.".into())
        })?;
        let Some(record) = user.find_memory(&memory_id).cloned() else {
            return Err(BotError::Validation(format!("Memory '{}' was not found.", memory_id)));
        };

        self.index
            .delete_chunks(user.id, &record.chunk_ids)
            .await
            .map_err(|e| BotError::Provider(format!("Could not forget '{}': {}", memory_id, e)))?;

        user.remove_memory(&memory_id);
        let user = self.persist(user).await?;
        self.recall.invalidate_user(user.id).await;
        Ok(Response::text(format!("Memory '{}' was forgotten.", memory_id)))
    }

    async fn forget_all(&self, mut user: UserRecord) -> Result<Response, BotError> {
        self.index
            .delete_all(user.id)
            .await
            .map_err(|e| BotError::Provider(format!("Could not forget memories: {}", e)))?;

        let removed = user.clear_memory().len();
        let user = self.persist(user).await?;
        self.recall.invalidate_user(user.id).await;
        Ok(Response::text(format!("Forgot {} memorized item(s).", removed)))
    }

    async fn focus(&self, mut user: UserRecord, arg: Option<String>) -> Result<Response, BotError> {
        let memory_id = arg.ok_or_else(|| {
            BotError::Validation("After '/focus' command you must input the memory id. Try again.".into())
        })?;
        let working = user
            .toggle_working(&memory_id)
            .ok_or_else(|| BotError::Validation(format!("Memory '{}' was not found.", memory_id)))?;

        self.persist(user).await?;
        Ok(Response::text(if working {
            format!("'{}' was added to working memory.", memory_id)
        } else {
            format!("'{}' was removed from working memory.", memory_id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{ADMIN_ONLY_MESSAGE, BLOCKED_MESSAGE, NOT_ALLOWED_MESSAGE};
    use crate::db::InMemoryUserStore;
    use crate::memory::RecallSettings;
    use crate::provider::ModelProvider;
    use crate::testing::{
        EchoProvider, FailingProvider, FailingStore, FakeImages, FakeLinks, FakeSpeech,
        FixedProvider, WordEmbedder,
    };
    use crate::types::Role;

    const ADMIN: i64 = 1;

    struct Harness {
        dispatcher: SessionDispatcher,
        store: Arc<dyn UserStore>,
        vectors: Arc<InMemoryIndex>,
    }

    impl Harness {
        async fn say(&self, user_id: i64, text: &str) -> Vec<String> {
            self.dispatcher
                .handle(InboundMessage::new(user_id, text))
                .await
                .into_iter()
                .map(|reply| reply.text)
                .collect()
        }

        async fn user(&self, user_id: i64) -> Option<UserRecord> {
            self.store.get_by_id(user_id).await.unwrap()
        }
    }

    fn registry(provider: Arc<dyn ModelProvider>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new(Model::Gpt3);
        for info in Model::catalogue() {
            if info.model != Model::Custom {
                registry.register(info.model, provider.clone());
            }
        }
        registry
    }

    fn build(
        store: Arc<dyn UserStore>,
        provider: Arc<dyn ModelProvider>,
        gate: AccessGate,
        settings: SessionSettings,
    ) -> Harness {
        let vectors = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(WordEmbedder);
        let recall = RecallSettings {
            limit: 3,
            min_relevance: 0.4,
            timeout: Duration::from_secs(2),
            cache_duration_secs: 60,
        };
        let dispatcher = SessionDispatcher::new(
            store.clone(),
            gate,
            registry(provider),
            MemoryIndex::new(embedder.clone(), vectors.clone()),
            MemoryRecall::new(embedder, vectors.clone(), recall),
            settings,
        )
        .with_images(Arc::new(FakeImages));

        Harness {
            dispatcher,
            store,
            vectors,
        }
    }

    fn harness_with(provider: Arc<dyn ModelProvider>) -> Harness {
        build(
            Arc::new(InMemoryUserStore::new()),
            provider,
            AccessGate::new(Some(ADMIN), None, false),
            SessionSettings::default(),
        )
    }

    fn harness() -> Harness {
        harness_with(Arc::new(EchoProvider::default()))
    }

    // ------------------------------------------------------------------------
    // Settings commands
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_model_command_sets_model() {
        let h = harness();

        assert_eq!(h.say(5, "/model gpt4").await, vec!["Model 'Gpt4' was set."]);
        assert_eq!(h.user(5).await.unwrap().model, Model::Gpt4);

        let replies = h.say(5, "/model llama").await;
        assert!(replies[0].contains("must input the model name"));
        let replies = h.say(5, "/model").await;
        assert!(replies[0].contains("must input the model name"));
        assert_eq!(h.user(5).await.unwrap().model, Model::Gpt4);
    }

    #[tokio::test]
    async fn test_unregistered_model_is_rejected() {
        let h = harness();
        let replies = h.say(5, "/model custom").await;
        assert_eq!(replies, vec!["Model 'Custom' is not available on this bot."]);
        assert_eq!(h.user(5).await.unwrap().model, Model::Gpt3);
    }

    #[tokio::test]
    async fn test_key_and_context_commands() {
        let provider = Arc::new(EchoProvider::default());
        let h = harness_with(provider.clone());

        assert!(h.say(5, "/key").await[0].contains("must input your API key"));
        assert_eq!(h.say(5, "/key sk-test").await, vec!["API key was set."]);
        assert_eq!(h.user(5).await.unwrap().api_key, "sk-test");

        assert!(h.say(5, "/context").await[0].contains("context (system) prompt"));
        assert_eq!(h.say(5, "/context be brief").await, vec!["Context prompt was set."]);

        h.say(5, "hello").await;
        let messages = provider.last_messages();
        assert_eq!(messages[0], crate::provider::ChatMessage::new(Role::System, "be brief"));

        assert_eq!(h.say(5, "/reset_context").await, vec!["Context prompt was deleted."]);
        let user = h.user(5).await.unwrap();
        assert_eq!(user.system_prompt(), None);
        assert_eq!(user.conversation.len(), 2);

        assert_eq!(h.say(5, "/reset").await, vec!["Current conversation was reset."]);
        assert!(h.user(5).await.unwrap().conversation.is_empty());
    }

    #[tokio::test]
    async fn test_toggles_and_info() {
        let h = harness();
        assert_eq!(h.say(5, "/toggle_voice").await, vec!["Voice mode is on."]);
        assert_eq!(h.say(5, "/toggle_img_quality").await, vec!["Image quality set to hd."]);
        assert_eq!(h.say(5, "/toggle_img_style").await, vec!["Image style set to vivid."]);
        assert!(h.say(5, "/toggle_context_filter").await[0].starts_with("Context filter is off"));

        let info = &h.say(5, "/info").await[0];
        assert!(info.contains("Voice mode: on"));
        assert!(info.contains("Image quality: hd"));
        assert!(info.contains("Context filter: off"));
    }

    // ------------------------------------------------------------------------
    // Conversation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_no_key_does_not_call_model() {
        let provider = Arc::new(EchoProvider::default());
        let h = harness_with(provider.clone());

        assert_eq!(h.say(5, "hello").await, vec![NO_KEY_MESSAGE]);
        assert_eq!(h.user(5).await.unwrap().conversation.len(), 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_turn_appends_exchange() {
        let h = harness();
        h.say(5, "/key sk-test").await;

        assert_eq!(h.say(5, "hello").await, vec!["echo: hello"]);
        let user = h.user(5).await.unwrap();
        let turns: Vec<(Role, &str)> = user
            .conversation
            .iter()
            .map(|t| (t.role, t.text.as_str()))
            .collect();
        assert_eq!(turns, vec![(Role::User, "hello"), (Role::Assistant, "echo: hello")]);

        assert!(h.say(5, "/history").await[0].contains("You: hello"));
    }

    #[tokio::test]
    async fn test_reset_threshold_sends_follow_up() {
        let settings = SessionSettings {
            reset_threshold: 2,
            ..SessionSettings::default()
        };
        let h = build(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(EchoProvider::default()),
            AccessGate::default(),
            settings,
        );
        h.say(5, "/key sk-test").await;
        h.say(5, "/context stay calm").await;

        for text in ["one", "two"] {
            assert_eq!(h.say(5, text).await.len(), 1);
            assert!(h.user(5).await.unwrap().user_turn_count() <= 2);
        }

        let replies = h.say(5, "three").await;
        assert_eq!(replies, vec!["echo: three", RESET_NOTICE]);
        let user = h.user(5).await.unwrap();
        assert_eq!(user.user_turn_count(), 0);
        assert_eq!(user.system_prompt(), Some("stay calm"));
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_serialized() {
        let provider = Arc::new(EchoProvider::with_delay(Duration::from_millis(50)));
        let h = harness_with(provider.clone());
        h.say(5, "/key sk-test").await;

        let (first, second) = tokio::join!(
            h.dispatcher.handle(InboundMessage::new(5, "first")),
            h.dispatcher.handle(InboundMessage::new(5, "second")),
        );
        assert_eq!(first[0].text, "echo: first");
        assert_eq!(second[0].text, "echo: second");

        let user = h.user(5).await.unwrap();
        let texts: Vec<&str> = user.conversation.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "echo: first", "second", "echo: second"]);
        // The second turn saw the first exchange
        assert_eq!(provider.last_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_turn_persists_nothing() {
        let provider = Arc::new(EchoProvider::with_delay(Duration::from_millis(500)));
        let h = harness_with(provider.clone());
        h.say(5, "/key sk-test").await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            h.dispatcher.handle(InboundMessage::new(5, "never stored")),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(h.user(5).await.unwrap().conversation.is_empty());

        // The dropped turn released the user's lock
        let next = tokio::time::timeout(Duration::from_secs(5), h.say(5, "/toggle_voice")).await;
        assert_eq!(next.unwrap(), vec!["Voice mode is on."]);
        let user = h.user(5).await.unwrap();
        assert!(user.voice_mode);
        assert!(user.conversation.is_empty());
    }

    #[tokio::test]
    async fn test_summarize_paragraphs_in_order() {
        let settings = SessionSettings {
            chunking: ChunkSettings {
                max_units_per_line: 128,
                max_units_per_paragraph: 3,
                overlap_units: 0,
            },
            ..SessionSettings::default()
        };
        let provider = Arc::new(EchoProvider::default());
        let h = build(
            Arc::new(InMemoryUserStore::new()),
            provider.clone(),
            AccessGate::default(),
            settings,
        );

        assert_eq!(h.say(5, "/summarize one two three").await, vec![NO_KEY_MESSAGE]);
        assert!(h.say(5, "/summarize").await[0].contains("must input a text or a link"));
        assert_eq!(provider.calls(), 0);

        h.say(5, "/key sk-test").await;
        let summary = &h.say(5, "/summarize one two three four five").await[0];
        assert!(summary.starts_with("echo: Create a summary"));
        assert_eq!(summary.matches("echo: ").count(), 2);
        let first = summary.find("one two three").unwrap();
        let second = summary.find("four five").unwrap();
        assert!(first < second);

        assert_eq!(provider.calls(), 2);
        assert!(h.user(5).await.unwrap().conversation.is_empty());
    }

    #[tokio::test]
    async fn test_summarize_failure_and_empty_answer() {
        let failing = harness_with(Arc::new(FailingProvider));
        failing.say(5, "/key sk-test").await;
        assert!(failing.say(5, "/summarize some text").await[0].contains("rate limited"));

        let empty = harness_with(Arc::new(FixedProvider("  ")));
        empty.say(5, "/key sk-test").await;
        assert_eq!(empty.say(5, "/summarize some text").await, vec![EMPTY_RESPONSE_MESSAGE]);
    }

    #[tokio::test]
    async fn test_leading_link_is_expanded() {
        let provider = Arc::new(EchoProvider::default());
        let mut h = harness_with(provider.clone());
        h.dispatcher = h.dispatcher.with_links(Arc::new(FakeLinks(Some("the video transcript"))));
        h.say(5, "/key sk-test").await;

        assert_eq!(
            h.say(5, "https://youtu.be/abc123").await,
            vec!["echo: the video transcript"]
        );
        // Links elsewhere in the text are left alone
        assert_eq!(
            h.say(5, "watch https://youtu.be/abc123").await,
            vec!["echo: watch https://youtu.be/abc123"]
        );
        assert!(h.say(5, "/summarize https://youtu.be/abc123").await[0].contains("the video transcript"));
    }

    #[tokio::test]
    async fn test_failed_link_expansion_keeps_message() {
        let mut h = harness();
        h.dispatcher = h.dispatcher.with_links(Arc::new(FakeLinks(None)));
        h.say(5, "/key sk-test").await;

        assert_eq!(
            h.say(5, "https://example.com/page").await,
            vec!["echo: https://example.com/page"]
        );
        let user = h.user(5).await.unwrap();
        assert_eq!(user.conversation[0].text, "https://example.com/page");
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_record_untouched() {
        let h = harness_with(Arc::new(FailingProvider));
        h.say(5, "/key sk-test").await;

        let replies = h.say(5, "hello").await;
        assert!(replies[0].contains("rate limited"));
        assert!(h.user(5).await.unwrap().conversation.is_empty());
    }

    #[tokio::test]
    async fn test_empty_answer() {
        let h = harness_with(Arc::new(FixedProvider("   ")));
        h.say(5, "/key sk-test").await;

        assert_eq!(h.say(5, "hello").await, vec![EMPTY_RESPONSE_MESSAGE]);
        assert!(h.user(5).await.unwrap().conversation.is_empty());
    }

    #[tokio::test]
    async fn test_model_timeout() {
        let settings = SessionSettings {
            model_timeout: Duration::from_millis(50),
            ..SessionSettings::default()
        };
        let h = build(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(EchoProvider::with_delay(Duration::from_secs(5))),
            AccessGate::default(),
            settings,
        );
        h.say(5, "/key sk-test").await;

        let replies = h.say(5, "hello").await;
        assert!(replies[0].contains("did not answer"));
        assert!(h.user(5).await.unwrap().conversation.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_discards_change() {
        let store = Arc::new(FailingStore::default());
        let h = build(
            store.clone(),
            Arc::new(EchoProvider::default()),
            AccessGate::default(),
            SessionSettings::default(),
        );
        h.say(5, "/key sk-test").await;
        store.set_failing(true);

        assert_eq!(h.say(5, "/model gpt4").await, vec![SAVE_FAILED_MESSAGE]);
        assert_eq!(h.say(5, "hello").await, vec![SAVE_FAILED_MESSAGE]);

        let user = h.user(5).await.unwrap();
        assert_eq!(user.model, Model::Gpt3);
        assert!(user.conversation.is_empty());
    }

    #[tokio::test]
    async fn test_voice_reply_and_fallback() {
        let h = harness();
        let dispatcher = h.dispatcher.with_speech(Arc::new(FakeSpeech { fail: false }));
        let h = Harness { dispatcher, ..h };
        h.say(5, "/key sk-test").await;
        h.say(5, "/toggle_voice").await;

        let replies = h.dispatcher.handle(InboundMessage::new(5, "hi")).await;
        assert_eq!(replies[0].attachments, vec![Attachment::Voice(b"echo: hi".to_vec())]);

        let dispatcher = h.dispatcher.with_speech(Arc::new(FakeSpeech { fail: true }));
        let h = Harness { dispatcher, ..h };
        let replies = h.dispatcher.handle(InboundMessage::new(5, "again")).await;
        assert_eq!(replies[0].text, "echo: again");
        assert!(replies[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn test_image_generation() {
        let h = harness();
        assert_eq!(h.say(5, "/image a cat").await, vec![NO_KEY_MESSAGE]);

        h.say(5, "/key sk-test").await;
        h.say(5, "/toggle_img_quality").await;
        let replies = h.dispatcher.handle(InboundMessage::new(5, "/image a cat")).await;
        assert_eq!(
            replies[0].attachments,
            vec![Attachment::Image(b"a cat|hd|natural".to_vec())]
        );
        assert!(h.say(5, "/image").await[0].contains("image description"));
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_non_admin_cannot_allow() {
        let h = harness();
        h.say(42, "/usage").await;
        assert_eq!(h.say(ADMIN, "/deny 42").await, vec!["User 42 was blocked."]);

        assert_eq!(h.say(7, "/allow 42").await, vec![ADMIN_ONLY_MESSAGE]);
        assert!(h.user(42).await.unwrap().is_blocked);

        assert_eq!(h.say(ADMIN, "/allow 42").await, vec!["User 42 was allowed."]);
        assert!(!h.user(42).await.unwrap().is_blocked);
    }

    #[tokio::test]
    async fn test_admin_follows_configured_id() {
        let store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());
        let before = build(
            store.clone(),
            Arc::new(EchoProvider::default()),
            AccessGate::new(Some(5), None, false),
            SessionSettings::default(),
        );
        assert!(before.say(5, "/users").await[0].starts_with("Users (1):"));
        assert!(before.user(5).await.unwrap().is_administrator);

        let after = build(
            store,
            Arc::new(EchoProvider::default()),
            AccessGate::new(Some(ADMIN), None, false),
            SessionSettings::default(),
        );
        assert_eq!(after.say(5, "/users").await, vec![ADMIN_ONLY_MESSAGE]);
        after.say(5, "/toggle_voice").await;
        assert!(!after.user(5).await.unwrap().is_administrator);

        assert_eq!(after.say(ADMIN, "/deny 5").await, vec!["User 5 was blocked."]);
        assert_eq!(after.say(5, "/toggle_voice").await, vec![BLOCKED_MESSAGE]);
    }

    #[tokio::test]
    async fn test_admin_command_edge_cases() {
        let h = harness();
        assert_eq!(h.say(ADMIN, "/allow 999").await, vec!["User 999 was not found."]);
        assert_eq!(h.say(ADMIN, "/deny 1").await, vec!["Administrators cannot be blocked."]);
        assert!(h.say(ADMIN, "/deny abc").await[0].contains("must input the user id"));

        let users = &h.say(ADMIN, "/users").await[0];
        assert!(users.starts_with("Users (1):"));
        assert!(users.contains("[admin]"));
    }

    #[tokio::test]
    async fn test_blocked_user_only_gets_informational_commands() {
        let h = build(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(EchoProvider::default()),
            AccessGate::new(Some(ADMIN), None, true),
            SessionSettings::default(),
        );

        assert_eq!(h.say(9, "/info").await, vec![BLOCKED_MESSAGE]);
        assert_eq!(h.say(9, "hello").await, vec![BLOCKED_MESSAGE]);
        assert!(h.say(9, "/usage").await[0].starts_with("Usage:"));
        assert!(!h.say(9, "/about").await[0].is_empty());
        assert!(h.user(9).await.unwrap().is_blocked);

        // The administrator is never created blocked
        assert!(h.say(ADMIN, "/usage").await[0].contains("/allow"));
        assert!(!h.user(ADMIN).await.unwrap().is_blocked);
    }

    #[tokio::test]
    async fn test_allow_list_rejects_before_creating() {
        let h = build(
            Arc::new(InMemoryUserStore::new()),
            Arc::new(EchoProvider::default()),
            AccessGate::new(Some(ADMIN), Some([2].into_iter().collect()), false),
            SessionSettings::default(),
        );

        assert_eq!(h.say(3, "/usage").await, vec![NOT_ALLOWED_MESSAGE]);
        assert!(h.user(3).await.is_none());
        assert!(h.say(2, "/usage").await[0].starts_with("Usage:"));
        assert!(h.say(ADMIN, "/usage").await[0].starts_with("Usage:"));
    }

    // ------------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_memorize_recall_focus_forget() {
        let provider = Arc::new(EchoProvider::default());
        let h = harness_with(provider.clone());
        h.say(5, "/key sk-test").await;

        assert_eq!(
            h.say(5, "/memorize pets.txt cats purr when happy").await,
            vec!["Memorized 'pets.txt' (1 chunk(s))."]
        );
        let user = h.user(5).await.unwrap();
        assert_eq!(user.memory_storage.len(), 1);
        assert!(user.is_working("pets.txt"));

        h.say(5, "do cats purr").await;
        let messages = provider.last_messages();
        assert!(messages
            .iter()
            .any(|m| m.role == Role::System && m.text.contains("cats purr when happy")));

        // Out of the working set with the filter on: nothing is recalled
        assert_eq!(
            h.say(5, "/focus pets.txt").await,
            vec!["'pets.txt' was removed from working memory."]
        );
        h.say(5, "do cats purr").await;
        assert!(provider.last_messages().iter().all(|m| m.role != Role::System));

        assert_eq!(h.say(5, "/forget pets.txt").await, vec!["Memory 'pets.txt' was forgotten."]);
        assert_eq!(h.vectors.point_count("user_5").await, 0);
        assert!(h.user(5).await.unwrap().memory_storage.is_empty());
        assert!(h.say(5, "/forget pets.txt").await[0].contains("was not found"));
    }

    #[tokio::test]
    async fn test_memorize_collision_and_forget_all() {
        let h = harness();
        h.say(5, "/key sk-test").await;
        assert!(h.say(5, "/memorize a.txt").await[0].contains("memory id and the text"));

        h.say(5, "/memorize a.txt first note").await;
        let replies = h.say(5, "/memorize a.txt second note").await;
        assert!(replies[0].starts_with("Memorized 'a_"));

        let user = h.user(5).await.unwrap();
        assert_eq!(user.memory_storage.len(), 2);
        assert!(h.say(5, "/memories").await[0].contains("• a.txt"));

        assert_eq!(h.say(5, "/forget_all").await, vec!["Forgot 2 memorized item(s)."]);
        assert!(!h.vectors.collection_exists("user_5").await.unwrap());
        assert!(h.user(5).await.unwrap().working_memory.is_empty());
    }

    #[tokio::test]
    async fn test_memorize_compensates_failed_persist() {
        let store = Arc::new(FailingStore::default());
        let h = build(
            store.clone(),
            Arc::new(EchoProvider::default()),
            AccessGate::default(),
            SessionSettings::default(),
        );
        h.say(5, "/key sk-test").await;
        store.set_failing(true);

        assert_eq!(
            h.say(5, "/memorize notes.txt remember the milk").await,
            vec![SAVE_FAILED_MESSAGE]
        );
        assert_eq!(h.vectors.point_count("user_5").await, 0);
        assert!(h.user(5).await.unwrap().memory_storage.is_empty());
    }
}
