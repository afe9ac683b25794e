//! Conversation messages for the backend streaming loop.
//!
//! A conversation is an ordered `Vec<Message>`; tool-result messages follow the
//! assistant message that carried their tool calls, keyed by `call_id`. The
//! history is bounded: [`trim_history`] keeps a leading system message and the
//! most recent tail.

use serde::{Deserialize, Serialize};
use stream_chunk::ToolCallPayload;
use tracing::debug;

/// Default bound on conversation length inside the tool-execution loop.
pub const DEFAULT_MAX_HISTORY: usize = 200;

/// One conversation message (system / user / assistant / tool result).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallPayload>,
    },
    /// Result of one tool execution, keyed by the provider call id.
    Tool {
        call_id: String,
        content: String,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Assistant message carrying only tool calls (content null).
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallPayload>) -> Self {
        Self::Assistant {
            content: None,
            tool_calls,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Tool {
            call_id: call_id.into(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}

/// Trims a conversation to `max_items`, always preserving a leading system
/// message; the rest of the result is the most recent suffix of the input.
pub fn trim_history(messages: Vec<Message>, max_items: usize) -> Vec<Message> {
    if max_items == 0 || messages.len() <= max_items {
        return messages;
    }

    let original_len = messages.len();
    let mut iter = messages.into_iter();
    let mut preserved = Vec::new();
    let mut remaining: Vec<Message>;

    let first = iter.next();
    match first {
        Some(msg) if msg.is_system() => {
            preserved.push(msg);
            remaining = iter.collect();
        }
        Some(msg) => {
            remaining = std::iter::once(msg).chain(iter).collect();
        }
        None => return preserved,
    }

    let allowed = max_items.saturating_sub(preserved.len());
    if remaining.len() > allowed {
        remaining.drain(..remaining.len() - allowed);
    }
    preserved.extend(remaining);

    debug!(
        from = original_len,
        to = preserved.len(),
        limit = max_items,
        "trimmed message history"
    );
    preserved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(len: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..len - 1 {
            msgs.push(Message::user(format!("m{}", i)));
        }
        msgs
    }

    #[test]
    fn trim_preserves_leading_system_and_recent_tail() {
        let msgs = conversation(250);
        let trimmed = trim_history(msgs.clone(), 200);
        assert_eq!(trimmed.len(), 200);
        assert_eq!(trimmed[0], Message::system("sys"));
        // The trailing 199 messages are a suffix of the input.
        assert_eq!(&trimmed[1..], &msgs[msgs.len() - 199..]);
    }

    #[test]
    fn trim_is_identity_below_bound() {
        let msgs = conversation(50);
        assert_eq!(trim_history(msgs.clone(), 200), msgs);
        assert_eq!(trim_history(msgs.clone(), 0), msgs);
    }

    #[test]
    fn trim_without_system_keeps_suffix_only() {
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("m{}", i))).collect();
        let trimmed = trim_history(msgs.clone(), 4);
        assert_eq!(trimmed.len(), 4);
        assert_eq!(trimmed, msgs[6..].to_vec());
    }

    #[test]
    fn assistant_tool_calls_serializes_with_null_content() {
        let msg = Message::assistant_tool_calls(vec![ToolCallPayload {
            id: "c1".into(),
            name: "mcp__fs__read_file".into(),
            arguments: "{}".into(),
        }]);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v["content"].is_null());
        assert_eq!(v["tool_calls"][0]["name"], "mcp__fs__read_file");
    }
}
