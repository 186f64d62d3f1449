//! ============================================================================
//! Prompt Assembly - System turn, recalled memory, trimmed history, message
//! ============================================================================

use crate::provider::ChatMessage;
use crate::types::{Role, UserRecord};

const REFERENCE_HEADER: &str =
    "Reference material from the user's memory. Use it when it is relevant to the question:";

/// Build the model input for a new user message.
///
/// History is replayed newest-first until `budget_chars` is spent, then put
/// back in order. The replay never starts with an assistant turn.
pub fn assemble(
    user: &UserRecord,
    fragments: &[String],
    message: &str,
    budget_chars: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(system) = user.system_prompt() {
        messages.push(ChatMessage::new(Role::System, system));
    }

    if !fragments.is_empty() {
        messages.push(ChatMessage::new(
            Role::System,
            format!("{}\n\n{}", REFERENCE_HEADER, fragments.join("\n---\n")),
        ));
    }

    let mut spent = 0usize;
    let mut replay: Vec<ChatMessage> = Vec::new();
    for turn in user.history().collect::<Vec<_>>().into_iter().rev() {
        let cost = turn.text.chars().count();
        if spent + cost > budget_chars {
            break;
        }
        spent += cost;
        replay.push(ChatMessage::new(turn.role, turn.text.clone()));
    }
    replay.reverse();
    while replay.first().is_some_and(|m| m.role == Role::Assistant) {
        replay.remove(0);
    }
    messages.extend(replay);

    messages.push(ChatMessage::new(Role::User, message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProfileFields;

    fn user_with_history() -> UserRecord {
        let mut user = UserRecord::new(1, &ProfileFields::default(), false);
        user.set_system_prompt("be brief");
        user.push_exchange("q1 aaaa", "a1 bbbb");
        user.push_exchange("q2 cccc", "a2 dddd");
        user
    }

    #[test]
    fn test_order_system_reference_history_message() {
        let user = user_with_history();
        let messages = assemble(&user, &["cats purr".to_string()], "new", 10_000);

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::System,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User
            ]
        );
        assert_eq!(messages[0].text, "be brief");
        assert!(messages[1].text.contains("cats purr"));
        assert_eq!(messages.last().unwrap().text, "new");
    }

    #[test]
    fn test_budget_keeps_most_recent_turns() {
        let user = user_with_history();
        // Room for three 7-char turns; the oldest kept one would be an
        // assistant turn, so it is dropped as well
        let messages = assemble(&user, &[], "new", 21);
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["be brief", "q2 cccc", "a2 dddd", "new"]);
    }

    #[test]
    fn test_no_system_no_history() {
        let user = UserRecord::new(2, &ProfileFields::default(), false);
        let messages = assemble(&user, &[], "hello", 100);
        assert_eq!(messages, vec![ChatMessage::new(Role::User, "hello")]);
    }
}
