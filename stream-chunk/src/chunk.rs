//! Chunk types (type + payload). The backend loop yields these in stream order;
//! the orchestrator consumes them without knowing anything about MCP internals.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool call as captured from a model stream: provider call id, function
/// name, and the raw JSON arguments string (accumulated from fragments).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Status discriminant for informational MCP chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpStatusKind {
    McpConnected,
    McpToolCalled,
    McpToolResponse,
    McpBlocked,
    McpError,
    FunctionCall,
    FunctionCallOutput,
    McpSessionComplete,
}

/// One chunk of the up-call stream.
///
/// Ordering is the stream order of the underlying model turn; `Done` is always
/// the final chunk of a turn. `ToolCalls` carries a non-MCP batch the
/// orchestrator must handle itself (workflow tools such as `vote`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Assistant text delta.
    Content { content: String },
    /// Model thinking delta, when the provider surfaces one.
    Reasoning { delta: String },
    ReasoningDone,
    /// Non-MCP tool calls awaiting external handling by the orchestrator.
    ToolCalls { tool_calls: Vec<ToolCallPayload> },
    /// Informational MCP status with a concise human phrase.
    McpStatus {
        status: McpStatusKind,
        content: String,
        source: String,
    },
    /// Assembled assistant message for consumers that want whole messages.
    CompleteMessage { message: Value },
    Done,
    Error { error: String },
}

impl StreamChunk {
    /// Shorthand for a content chunk.
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
        }
    }

    /// Shorthand for an MCP status chunk.
    pub fn mcp_status(
        status: McpStatusKind,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::McpStatus {
            status,
            content: content.into(),
            source: source.into(),
        }
    }

    /// Serializes this chunk to a JSON object (type + payload).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serializes_with_snake_case_type_tag() {
        let v = StreamChunk::content("hi").to_value().unwrap();
        assert_eq!(v["type"], "content");
        assert_eq!(v["content"], "hi");

        let v = StreamChunk::mcp_status(McpStatusKind::McpConnected, "ok", "mcp_setup")
            .to_value()
            .unwrap();
        assert_eq!(v["type"], "mcp_status");
        assert_eq!(v["status"], "mcp_connected");
    }

    #[test]
    fn tool_calls_chunk_round_trips() {
        let chunk = StreamChunk::ToolCalls {
            tool_calls: vec![ToolCallPayload {
                id: "call_1".into(),
                name: "vote".into(),
                arguments: "{\"agent\":\"a1\"}".into(),
            }],
        };
        let v = chunk.to_value().unwrap();
        let back: StreamChunk = serde_json::from_value(v).unwrap();
        match back {
            StreamChunk::ToolCalls { tool_calls } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].name, "vote");
            }
            other => panic!("unexpected chunk: {:?}", other),
        }
    }
}
