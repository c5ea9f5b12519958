use std::fs;
use std::path::Path;

use tracing::warn;

use bookdesk_core::domain::session::{Message, MessageRole};

use crate::llm::ChatMessage;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful library desk assistant. \
Use the available tools to search books, create orders, restock inventory, update prices, \
check order status and summarize low stock. Always look books up before acting on them and \
never invent ISBNs, prices or stock levels. When a tool reports an error, explain it briefly \
and suggest what to do next.";

/// Reads the operator-supplied system prompt, falling back to the built-in one when the
/// file is missing, unreadable or blank.
pub fn load_system_prompt(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };

    match fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        Ok(_) => {
            warn!(
                event_name = "agent.prompt.empty",
                path = %path.display(),
                "system prompt file is empty; using built-in prompt"
            );
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
        Err(error) => {
            warn!(
                event_name = "agent.prompt.unreadable",
                path = %path.display(),
                error = %error,
                "system prompt file could not be read; using built-in prompt"
            );
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

/// Stored messages that precede the current turn, capped to the newest `limit`.
///
/// `recent` is oldest-first and may end with the message that was just persisted for
/// this turn; that message is dropped so it is not sent twice.
pub fn prior_history(recent: &[Message], current_message_id: i64, limit: usize) -> Vec<Message> {
    let earlier: Vec<&Message> =
        recent.iter().filter(|message| message.id != current_message_id).collect();
    let skip = earlier.len().saturating_sub(limit);
    earlier.into_iter().skip(skip).cloned().collect()
}

/// System prompt, then history, then the new user message.
pub fn build_transcript(
    system_prompt: &str,
    history: &[Message],
    user_message: &str,
) -> Vec<ChatMessage> {
    let mut transcript = Vec::with_capacity(history.len() + 2);
    transcript.push(ChatMessage::system(system_prompt));
    transcript.extend(history.iter().map(|message| match message.role {
        MessageRole::User => ChatMessage::user(message.content.clone()),
        MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
        MessageRole::System => ChatMessage::system(message.content.clone()),
    }));
    transcript.push(ChatMessage::user(user_message));
    transcript
}
