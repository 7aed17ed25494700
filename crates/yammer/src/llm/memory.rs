//! Chat message shapes and the conversation memory window.
//!
//! Memory is a flat message list persisted in the node's config. The window
//! keeps at most `max_turns` of the most recent user turns (each with its
//! following assistant reply), always preserving a leading system message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role, as the chat endpoint spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Parse a persisted memory array; unknown entries are skipped.
pub fn memory_from_value(value: Option<&Value>) -> Vec<ChatMessage> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn memory_to_value(memory: &[ChatMessage]) -> Value {
    serde_json::to_value(memory).unwrap_or(Value::Array(Vec::new()))
}

fn user_count(messages: &[ChatMessage]) -> usize {
    messages.iter().filter(|m| m.role == Role::User).count()
}

/// Drop the oldest non-system user message (and its trailing assistant
/// reply) until at most `max_turns` user messages remain.
pub fn prune_window(messages: &mut Vec<ChatMessage>, max_turns: usize) {
    while user_count(messages) > max_turns {
        let Some(idx) = messages.iter().position(|m| m.role == Role::User) else {
            break;
        };
        messages.remove(idx);
        if messages.get(idx).map(|m| m.role) == Some(Role::Assistant) {
            messages.remove(idx);
        }
    }
}

/// Assemble the request message list for a new turn.
pub fn build_messages(
    system: &str,
    use_system: bool,
    memory: &[ChatMessage],
    memory_on: bool,
    user_text: &str,
    max_turns: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if use_system && !system.trim().is_empty() {
        messages.push(ChatMessage::system(system.trim()));
    }
    if memory_on {
        for m in memory {
            if m.role == Role::System {
                // A remembered system message only survives if none was set.
                if !messages.iter().any(|x| x.role == Role::System) {
                    messages.push(m.clone());
                }
            } else {
                messages.push(m.clone());
            }
        }
    }
    messages.push(ChatMessage::user(user_text));
    if memory_on {
        prune_window(&mut messages, max_turns);
    }
    messages
}

/// Rebuild memory after a finished turn: keep any leading system, append the
/// user message and the assistant reply (when any text was produced), and
/// prune to the window.
pub fn rebuild_memory(
    previous: &[ChatMessage],
    user_text: &str,
    assistant_text: Option<&str>,
    max_turns: usize,
) -> Vec<ChatMessage> {
    let mut memory: Vec<ChatMessage> = previous.to_vec();
    memory.push(ChatMessage::user(user_text));
    if let Some(text) = assistant_text {
        if !text.trim().is_empty() {
            memory.push(ChatMessage::assistant(text.trim()));
        }
    }
    prune_window(&mut memory, max_turns);
    memory
}
