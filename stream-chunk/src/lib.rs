//! Stream chunk protocol: the ordered chunk stream a backend loop emits up to
//! the orchestrator (content deltas, tool-call batches, MCP status, done/error).

mod chunk;

pub use chunk::{McpStatusKind, StreamChunk, ToolCallPayload};
