//! Model client abstraction for the backend streaming loop.
//!
//! Provider HTTP clients live outside this crate; the loop consumes any
//! implementation of [`ModelClient`] as a black-box streaming source. This
//! module defines the event stream shape, the tool-call fragment accumulator,
//! and a scripted [`MockModel`] for tests.

mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde_json::Value;
use stream_chunk::ToolCallPayload;
use tracing::warn;

use crate::error::McpError;
use crate::message::Message;

pub use mock::MockModel;

/// Parameters for one model turn: the conversation so far plus the merged
/// tool definitions (MCP functions and provider-native tools) in the
/// provider's encoding.
#[derive(Clone, Debug)]
pub struct ApiParams {
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
}

/// One event from a model stream.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    /// Assistant text delta.
    Content(String),
    /// Thinking delta, for providers that surface reasoning.
    Reasoning(String),
    ReasoningDone,
    /// One fragment of a streamed tool call; fragments with the same `index`
    /// belong to the same call and their `arguments` concatenate.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Stream end marker with the provider's finish reason when known.
    Completed { finish_reason: Option<String> },
}

/// Boxed stream of model events.
pub type ModelEventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, McpError>> + Send>>;

/// A streaming model backend.
///
/// **Interaction**: the only surface the backend loop needs from a provider.
/// Implementations translate their native SSE/delta formats into
/// [`ModelEvent`]s.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, params: ApiParams) -> Result<ModelEventStream, McpError>;
}

#[derive(Clone, Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments by index.
///
/// A call is complete when it has a non-empty function name and parseable
/// arguments JSON; incomplete calls are dropped with a warning. A missing call
/// id is synthesized from the index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: Vec<Option<PartialCall>>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, id: Option<String>, name: Option<String>, arguments: &str) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        let slot = self.slots[index].get_or_insert_with(PartialCall::default);
        if let Some(id) = id {
            if !id.is_empty() && id != slot.id {
                slot.id = id;
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                slot.name = name;
            }
        }
        slot.arguments.push_str(arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Validates completeness and returns the captured calls in index order.
    pub fn finish(self) -> Vec<ToolCallPayload> {
        let mut calls = Vec::new();
        for (index, slot) in self.slots.into_iter().enumerate() {
            let Some(call) = slot else { continue };
            if call.name.is_empty() {
                warn!(index, "incomplete tool call (no name), skipping execution");
                continue;
            }
            let arguments = if call.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                call.arguments
            };
            if serde_json::from_str::<Value>(&arguments).is_err() {
                warn!(name = %call.name, "incomplete tool call (unparseable arguments), skipping execution");
                continue;
            }
            let id = if call.id.is_empty() {
                format!("toolcall_{}", index)
            } else {
                call.id
            };
            calls.push(ToolCallPayload {
                id,
                name: call.name,
                arguments,
            });
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_merges_fragments_by_index() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_1".into()), Some("read_file".into()), "");
        acc.push(0, None, None, r#"{"path":"#);
        acc.push(0, None, None, r#""/work/hello.txt"}"#);
        acc.push(1, None, Some("vote".into()), r#"{"agent":"a1"}"#);

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, r#"{"path":"/work/hello.txt"}"#);
        // Missing id is synthesized from the slot index.
        assert_eq!(calls[1].id, "toolcall_1");
    }

    #[test]
    fn incomplete_calls_are_dropped() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("c0".into()), None, r#"{"x":1}"#); // no name
        acc.push(1, Some("c1".into()), Some("t".into()), r#"{"x":"#); // bad json
        acc.push(2, None, Some("ok".into()), ""); // empty args become {}
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
        assert_eq!(calls[0].arguments, "{}");
    }
}
