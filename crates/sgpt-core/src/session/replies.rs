//! ============================================================================
//! Reply Texts - Fixed messages and informational command output
//! ============================================================================

use chrono::{TimeZone, Utc};

use crate::types::{Model, Role, UserRecord};

pub const SAVE_FAILED_MESSAGE: &str = "Could not save your changes. Please try again.";
pub const LOAD_FAILED_MESSAGE: &str = "Could not load your profile. Please try again.";
pub const NO_KEY_MESSAGE: &str = "Your API key is not set. Use '/key' command and set key.";
pub const EMPTY_RESPONSE_MESSAGE: &str = "Response from model is empty. Try again.";
pub const RESET_NOTICE: &str = "I reset the context of our conversation.";

pub const ABOUT_TEXT: &str = "SGPT is a personal assistant bot. Bring your own API key, pick a model \
and chat. Use /memorize to store notes and documents; relevant parts are recalled automatically \
in later conversations.";

pub fn model_usage() -> String {
    let names: Vec<String> = Model::catalogue()
        .iter()
        .map(|info| format!("'{}' ({})", info.aliases[0], info.pretty_name))
        .collect();
    format!(
        "After '/model' command you must input the model name.\nModel name must be one of: {}.\nTry again.",
        names.join(", ")
    )
}

pub fn usage(is_admin: bool) -> String {
    let mut usage = String::from(
        "Usage:\n\
         /key - set your API key\n\
         /model - choose the model to work with\n\
         /context - set the context message\n\
         /reset_context - reset the context message\n\
         /history - view the conversation history\n\
         /reset - reset the current conversation\n\
         /image - generate an image from a description\n\
         /summarize - summarize a text or a link: /summarize <text or url>\n\
         /toggle_voice - answer with voice messages\n\
         /toggle_img_quality - switch image quality (standard/hd)\n\
         /toggle_img_style - switch image style (natural/vivid)\n\
         /memorize - store text: /memorize <id> <text>\n\
         /memories - list memorized items\n\
         /forget - delete a memorized item: /forget <id>\n\
         /forget_all - delete every memorized item\n\
         /focus - add or remove an item from working memory\n\
         /toggle_context_filter - limit recall to working memory\n\
         /usage - view the command list\n\
         /info - show current settings\n\
         /about - about this bot",
    );
    if is_admin {
        usage.push_str(
            "\n---\n\
             /allow - allow user: /allow <id>\n\
             /deny - deny user: /deny <id>\n\
             /users - show users",
        );
    }
    usage
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        "not set".to_string()
    } else if chars.len() <= 8 {
        "****".to_string()
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

pub fn info(user: &UserRecord) -> String {
    format!(
        "First name: {}\n\
         Last name: {}\n\
         Username: {}\n\
         API key: {}\n\
         Model: {}\n\
         Context prompt: {}\n\
         Voice mode: {}\n\
         Image quality: {}\n\
         Image style: {}\n\
         Memorized items: {} ({} in working memory)\n\
         Context filter: {}",
        user.first_name,
        user.last_name,
        user.user_name,
        mask_key(&user.api_key),
        user.model,
        user.system_prompt().unwrap_or(""),
        on_off(user.voice_mode),
        user.img_quality.api_value(),
        user.img_style.api_value(),
        user.memory_storage.len(),
        user.working_memory.len(),
        on_off(user.context_filter),
    )
}

pub fn history(user: &UserRecord) -> String {
    let lines: Vec<String> = user
        .history()
        .map(|turn| {
            let who = match turn.role {
                Role::User => "You",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            format!("{}: {}", who, turn.text)
        })
        .collect();

    if lines.is_empty() {
        "Conversation history is empty.".to_string()
    } else {
        lines.join("\n\n")
    }
}

pub fn memories(user: &UserRecord) -> String {
    if user.memory_storage.is_empty() {
        return "You have no memorized items.".to_string();
    }

    let mut text = String::from("Memorized items:\n");
    for item in &user.memory_storage {
        let working = if user.is_working(&item.memory_id) {
            " [working]"
        } else {
            ""
        };
        text.push_str(&format!(
            "• {} ({} chunk(s), {}){}\n",
            item.memory_id,
            item.chunk_ids.len(),
            format_timestamp(item.created_at),
            working
        ));
    }
    text.push_str(&format!("Context filter: {}", on_off(user.context_filter)));
    text
}

pub fn users(all: &[UserRecord]) -> String {
    if all.is_empty() {
        return "No users yet.".to_string();
    }

    let mut text = format!("Users ({}):\n", all.len());
    for user in all {
        let mut flags = Vec::new();
        if user.is_administrator {
            flags.push("admin");
        }
        if user.is_blocked {
            flags.push("blocked");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        text.push_str(&format!(
            "{} {}{} - last seen {}\n",
            user.id,
            user.display_name(),
            flags,
            format_timestamp(user.last_activity)
        ));
    }
    text.trim_end().to_string()
}

pub fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
