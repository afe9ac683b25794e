//! Scripted model for tests: each call to `stream` replays the next scripted
//! turn of events.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApiParams, ModelClient, ModelEvent, ModelEventStream};
use crate::error::McpError;

/// A model client that replays scripted turns.
///
/// **Interaction**: used by unit and integration tests to drive the backend
/// loop without a provider. Records the params of every call so tests can
/// assert on the conversation the loop actually sent.
#[derive(Default)]
pub struct MockModel {
    turns: Mutex<VecDeque<Vec<ModelEvent>>>,
    calls: Mutex<Vec<ApiParams>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one scripted turn; turns replay in push order.
    pub fn push_turn(&self, events: Vec<ModelEvent>) {
        self.turns.lock().expect("turns lock poisoned").push_back(events);
    }

    /// Scripted turn ending in a plain text answer.
    pub fn push_text_turn(&self, text: &str) {
        self.push_turn(vec![
            ModelEvent::Content(text.to_string()),
            ModelEvent::Completed {
                finish_reason: Some("stop".to_string()),
            },
        ]);
    }

    /// Scripted turn emitting one complete tool call.
    pub fn push_tool_call_turn(&self, call_id: &str, name: &str, arguments: &str) {
        self.push_turn(vec![
            ModelEvent::ToolCallDelta {
                index: 0,
                id: Some(call_id.to_string()),
                name: Some(name.to_string()),
                arguments: arguments.to_string(),
            },
            ModelEvent::Completed {
                finish_reason: Some("tool_calls".to_string()),
            },
        ]);
    }

    /// Params of every `stream` call so far.
    pub fn recorded_calls(&self) -> Vec<ApiParams> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn stream(&self, params: ApiParams) -> Result<ModelEventStream, McpError> {
        self.calls.lock().expect("calls lock poisoned").push(params);
        let events = self
            .turns
            .lock()
            .expect("turns lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                vec![ModelEvent::Completed {
                    finish_reason: Some("stop".to_string()),
                }]
            });
        Ok(Box::pin(tokio_stream::iter(
            events.into_iter().map(Ok::<_, McpError>),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn turns_replay_in_order_and_default_to_stop() {
        let model = MockModel::new();
        model.push_text_turn("first");

        let params = ApiParams {
            messages: vec![],
            tools: vec![],
        };
        let mut stream = model.stream(params.clone()).await.unwrap();
        match stream.next().await {
            Some(Ok(ModelEvent::Content(text))) => assert_eq!(text, "first"),
            other => panic!("unexpected: {:?}", other),
        }

        // Exhausted scripts end with a bare stop.
        let mut stream = model.stream(params).await.unwrap();
        match stream.next().await {
            Some(Ok(ModelEvent::Completed { finish_reason })) => {
                assert_eq!(finish_reason.as_deref(), Some("stop"))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(model.recorded_calls().len(), 2);
    }
}
