// ============================================================================
// Telegram transport - Bot API long polling in front of the dispatcher
// ============================================================================
// Updates are fanned out to one worker task per user. A worker handles its
// user's messages strictly in arrival order; different users run
// concurrently, so a slow model call for one user never holds up another.
// ============================================================================

use anyhow::{anyhow, bail, Result};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sgpt_core::{Attachment, InboundMessage, ProfileFields, Reply, SessionDispatcher};

/// Telegram rejects messages longer than 4096 characters
const MAX_MESSAGE_CHARS: usize = 3500;
const MAX_CAPTION_CHARS: usize = 1024;
const POLL_TIMEOUT_SECS: u64 = 25;

/// Ordered inbox of one user's updates
struct UserWorker {
    sender: mpsc::UnboundedSender<(i64, InboundMessage)>,
    /// Queued or in-flight messages; only the poll loop increments it
    pending: Arc<AtomicUsize>,
}

pub struct TelegramBot {
    client: Client,
    base_url: String,
    dispatcher: Arc<SessionDispatcher>,
}

impl TelegramBot {
    pub fn new(token: &str, dispatcher: Arc<SessionDispatcher>) -> Result<Self> {
        Self::with_api_base("https://api.telegram.org", token, dispatcher)
    }

    fn with_api_base(api_base: &str, token: &str, dispatcher: Arc<SessionDispatcher>) -> Result<Self> {
        if token.trim().is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is empty");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), token.trim()),
            dispatcher,
        })
    }

    /// Poll for updates until the task is cancelled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut workers: HashMap<i64, UserWorker> = HashMap::new();
        info!("Telegram transport listening for updates");

        loop {
            let updates = match self.fetch_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    if e.to_string().contains("409") {
                        // Another instance is polling with the same token
                        warn!("getUpdates conflict, another bot instance is running; retrying in 15s");
                        tokio::time::sleep(Duration::from_secs(15)).await;
                    } else {
                        warn!("getUpdates failed: {}; retrying in 5s", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    continue;
                }
            };

            for update in updates {
                offset = update.update_id + 1;

                let Some(message) = update.message else {
                    continue;
                };
                let (Some(text), Some(from)) = (message.text, message.from) else {
                    continue;
                };

                let inbound = InboundMessage {
                    user_id: from.id,
                    message_id: Some(message.message_id),
                    profile: ProfileFields {
                        first_name: from.first_name,
                        last_name: from.last_name.unwrap_or_default(),
                        user_name: from.username.unwrap_or_default(),
                    },
                    text: normalize_command(&text),
                };
                let chat_id = message.chat.id;

                Self::enqueue(&self, &mut workers, chat_id, inbound);
            }

            // Idle workers are dropped; their tasks end when the sender goes away
            workers.retain(|_, worker| worker.pending.load(Ordering::Acquire) > 0);
        }
    }

    fn enqueue(
        bot: &Arc<Self>,
        workers: &mut HashMap<i64, UserWorker>,
        chat_id: i64,
        inbound: InboundMessage,
    ) {
        let user_id = inbound.user_id;
        let worker = workers
            .entry(user_id)
            .or_insert_with(|| Self::spawn_worker(Arc::clone(bot)));

        worker.pending.fetch_add(1, Ordering::AcqRel);
        if worker.sender.send((chat_id, inbound)).is_err() {
            worker.pending.fetch_sub(1, Ordering::AcqRel);
            error!("Worker for user {} is gone, dropping update", user_id);
            workers.remove(&user_id);
        }
    }

    fn spawn_worker(bot: Arc<Self>) -> UserWorker {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(i64, InboundMessage)>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);

        tokio::spawn(async move {
            while let Some((chat_id, inbound)) = receiver.recv().await {
                let typing = Arc::clone(&bot);
                tokio::spawn(async move { typing.send_chat_action(chat_id, "typing").await });

                for reply in bot.dispatcher.handle(inbound).await {
                    if let Err(e) = bot.deliver(chat_id, &reply).await {
                        error!("Failed to deliver reply to chat {}: {}", chat_id, e);
                    }
                }
                counter.fetch_sub(1, Ordering::AcqRel);
            }
        });

        UserWorker { sender, pending }
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
        payload.into_result("getUpdates")
    }

    async fn deliver(&self, chat_id: i64, reply: &Reply) -> Result<()> {
        let reply_to = reply.reply_to;

        if let Some(Attachment::Voice(audio)) = reply
            .attachments
            .iter()
            .find(|a| matches!(a, Attachment::Voice(_)))
        {
            return self
                .send_file(
                    chat_id,
                    reply_to,
                    "sendVoice",
                    "voice",
                    "answer.ogg",
                    "audio/ogg",
                    audio.clone(),
                    None,
                )
                .await;
        }

        if let Some(Attachment::Image(image)) = reply
            .attachments
            .iter()
            .find(|a| matches!(a, Attachment::Image(_)))
        {
            let caption: String = reply.text.chars().take(MAX_CAPTION_CHARS).collect();
            return self
                .send_file(
                    chat_id,
                    reply_to,
                    "sendPhoto",
                    "photo",
                    "image.png",
                    "image/png",
                    image.clone(),
                    Some(caption),
                )
                .await;
        }

        for chunk in chunk_message(&reply.text, MAX_MESSAGE_CHARS) {
            self.send_message(chat_id, reply_to, &chunk).await?;
        }
        Ok(())
    }

    async fn send_message(&self, chat_id: i64, reply_to: Option<i64>, text: &str) -> Result<()> {
        let body = SendMessageRequest {
            chat_id,
            text,
            reply_to_message_id: reply_to,
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse<serde_json::Value> = response.json().await?;
        payload.into_result("sendMessage").map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_file(
        &self,
        chat_id: i64,
        reply_to: Option<i64>,
        method: &str,
        field: &'static str,
        file_name: &'static str,
        mime: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<()> {
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| anyhow!("Invalid mime type {}: {}", mime, e))?;

        let mut form = Form::new().text("chat_id", chat_id.to_string()).part(field, part);
        if let Some(reply_to) = reply_to {
            form = form.text("reply_to_message_id", reply_to.to_string());
        }
        if let Some(caption) = caption {
            form = form.text("caption", caption);
        }

        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse<serde_json::Value> = response.json().await?;
        payload.into_result(method).map(|_| ())
    }

    /// Best-effort; a failed typing indicator is only logged
    async fn send_chat_action(&self, chat_id: i64, action: &str) {
        let body = serde_json::json!({ "chat_id": chat_id, "action": action });
        if let Err(e) = self
            .client
            .post(format!("{}/sendChatAction", self.base_url))
            .json(&body)
            .send()
            .await
        {
            debug!("sendChatAction failed for chat {}: {}", chat_id, e);
        }
    }
}

/// Strip the `@botname` suffix Telegram appends to commands in group chats
pub fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };
    let command = command.split_once('@').map(|(base, _)| base).unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, rest)
    }
}

/// Split on line boundaries so each piece fits one message
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        // A single overlong line is hard-split
        let pieces: Vec<String> = line
            .chars()
            .collect::<Vec<_>>()
            .chunks(max_chars.saturating_sub(1).max(1))
            .map(|piece| piece.iter().collect())
            .collect();
        let pieces = if pieces.is_empty() { vec![String::new()] } else { pieces };

        for piece in pieces {
            let piece_len = piece.chars().count() + 1;
            if current_len > 0 && current_len + piece_len > max_chars {
                chunks.push(current.trim_end().to_string());
                current.clear();
                current_len = 0;
            }
            current.push_str(&piece);
            current.push('\n');
            current_len += piece_len;
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T: Default> TelegramResponse<T> {
    fn into_result(self, method: &str) -> Result<T> {
        if !self.ok {
            let description = self
                .description
                .unwrap_or_else(|| format!("telegram {} failed", method));
            bail!(description);
        }
        Ok(self.result.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    from: Option<TelegramUser>,
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    last_name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    disable_web_page_preview: bool,
}
