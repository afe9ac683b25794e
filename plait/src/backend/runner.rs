//! The stream-and-execute driver.
//!
//! One iteration: build params from the conversation and merged tools, open a
//! model stream, forward content/reasoning chunks, accumulate tool-call
//! fragments. No calls → done. Any non-MCP call (a workflow tool such as
//! `vote`) → hand the whole batch up to the orchestrator. Otherwise execute
//! the MCP calls sequentially with retry, append their results, trim history,
//! and go again, bounded by `max_iterations`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use stream_chunk::{McpStatusKind, StreamChunk, ToolCallPayload};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::retry_delay;
use crate::function::{FunctionRegistry, PermissionHook};
use crate::mcp::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::mcp::registry::MultiServerRegistry;
use crate::mcp::spec::ServerSpec;
use crate::message::{trim_history, Message, DEFAULT_MAX_HISTORY};
use crate::model::{ApiParams, ModelClient, ModelEvent, ToolCallAccumulator};
use crate::permission::PathPermissionManager;

/// Tuning for one backend's loop.
#[derive(Clone, Debug)]
pub struct RunnerOptions {
    /// Upper bound on model-turn iterations per run.
    pub max_iterations: usize,
    /// Conversation length bound inside the loop (system message preserved).
    pub max_history: usize,
    /// Per-tool-call retry attempts beyond the first.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Connection attempts during setup before the breaker escalates.
    pub setup_max_attempts: u32,
    /// Per-session operation deadline.
    pub session_timeout: Duration,
    /// Provider-native tool definitions merged with the MCP functions
    /// (workflow tools like `vote` / `new_answer` live here).
    pub provider_tools: Vec<Value>,
    /// Registry-wide tool filters applied on top of per-spec lists.
    pub allowed_tools: Option<Vec<String>>,
    pub exclude_tools: Option<Vec<String>>,
    pub breaker: CircuitBreakerConfig,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_history: DEFAULT_MAX_HISTORY,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            setup_max_attempts: 3,
            session_timeout: Duration::from_secs(30),
            provider_tools: Vec::new(),
            allowed_tools: None,
            exclude_tools: None,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Extracts the server segment of an external tool name
/// (`mcp__<server>__<tool>`).
fn server_from_external_name(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("mcp__")?;
    rest.split_once("__").map(|(server, _)| server)
}

/// Drives the streaming loop for one backend.
pub struct BackendRunner {
    model: Arc<dyn ModelClient>,
    specs: Vec<ServerSpec>,
    options: RunnerOptions,
    breaker: CircuitBreaker,
    permission_manager: Option<Arc<PathPermissionManager>>,
    /// Serializes setup so concurrent users of the same backend don't race.
    setup_lock: tokio::sync::Mutex<()>,
    mcp: StdMutex<Option<Arc<MultiServerRegistry>>>,
    functions: StdMutex<Option<Arc<FunctionRegistry>>>,
    /// Pending one-time `mcp_connected` status, emitted by the next run.
    pending_connected: StdMutex<Option<StreamChunk>>,
    permanently_blocked: AtomicBool,
    blocked_notified: AtomicBool,
    no_mcp_notified: AtomicBool,
}

impl BackendRunner {
    pub fn new(model: Arc<dyn ModelClient>, specs: Vec<ServerSpec>, options: RunnerOptions) -> Self {
        let breaker = CircuitBreaker::new(options.breaker);
        Self {
            model,
            specs,
            options,
            breaker,
            permission_manager: None,
            setup_lock: tokio::sync::Mutex::new(()),
            mcp: StdMutex::new(None),
            functions: StdMutex::new(None),
            pending_connected: StdMutex::new(None),
            permanently_blocked: AtomicBool::new(false),
            blocked_notified: AtomicBool::new(false),
            no_mcp_notified: AtomicBool::new(false),
        }
    }

    /// Installs a path permission manager; it becomes a global pre-call hook
    /// on the function registry at setup.
    pub fn with_permission_manager(mut self, manager: Arc<PathPermissionManager>) -> Self {
        self.permission_manager = Some(manager);
        self
    }

    /// Injects a pre-built function registry (tests, non-MCP functions).
    pub fn with_function_registry(self, registry: FunctionRegistry) -> Self {
        *self.functions.lock().expect("functions lock poisoned") = Some(Arc::new(registry));
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn functions_registry(&self) -> Option<Arc<FunctionRegistry>> {
        self.functions.lock().expect("functions lock poisoned").clone()
    }

    pub fn mcp_registry(&self) -> Option<Arc<MultiServerRegistry>> {
        self.mcp.lock().expect("mcp lock poisoned").clone()
    }

    pub fn is_permanently_blocked(&self) -> bool {
        self.permanently_blocked.load(Ordering::SeqCst)
    }

    /// Connects the configured servers and publishes the function registry.
    ///
    /// Guarded by the per-backend setup lock; later callers see the Ready
    /// state and return immediately. Breaker-filtered servers are skipped;
    /// when every server is open, or every attempt fails, the backend is
    /// permanently blocked and runs in no-MCP mode from then on.
    pub async fn setup_mcp_tools(&self) {
        if self.specs.is_empty() {
            return;
        }
        let _guard = self.setup_lock.lock().await;
        if self.functions_registry().is_some() || self.is_permanently_blocked() {
            return;
        }

        let filtered: Vec<ServerSpec> = self
            .specs
            .iter()
            .filter(|spec| !self.breaker.should_skip(&spec.name))
            .cloned()
            .collect();
        if filtered.is_empty() {
            warn!("all MCP servers blocked by circuit breaker during setup");
            self.permanently_blocked.store(true, Ordering::SeqCst);
            return;
        }

        for attempt in 0..self.options.setup_max_attempts {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, self.options.retry_base_delay);
                info!(attempt = attempt + 1, ?delay, "retrying MCP setup");
                tokio::time::sleep(delay).await;
            }
            match MultiServerRegistry::connect_all(
                &filtered,
                self.options.session_timeout,
                self.options.allowed_tools.as_deref(),
                self.options.exclude_tools.as_deref(),
            )
            .await
            {
                Ok(registry) => {
                    let registry = Arc::new(registry);
                    for name in registry.server_names() {
                        self.breaker.record_success(&name);
                    }
                    let mut functions = FunctionRegistry::from_mcp(&registry);
                    if let Some(manager) = &self.permission_manager {
                        functions.add_global_hook(Arc::new(PermissionHook::new(Arc::clone(manager))));
                    }
                    let connected = registry.server_names().len();
                    *self.pending_connected.lock().expect("pending lock poisoned") =
                        Some(StreamChunk::mcp_status(
                            McpStatusKind::McpConnected,
                            format!("✅ [MCP] Connected to {} servers", connected),
                            "mcp_setup",
                        ));
                    // Copy-on-publish: readers swap to the fresh registry whole.
                    *self.mcp.lock().expect("mcp lock poisoned") = Some(registry);
                    *self.functions.lock().expect("functions lock poisoned") =
                        Some(Arc::new(functions));
                    info!("MCP setup successful");
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "MCP setup attempt failed");
                    for spec in &filtered {
                        self.breaker.record_failure(&spec.name);
                    }
                }
            }
        }
        warn!("MCP setup failed after breaker-managed retries - permanently blocked");
        self.permanently_blocked.store(true, Ordering::SeqCst);
    }

    /// Disconnects all sessions and clears the published registries.
    pub async fn cleanup_mcp(&self) {
        let registry = self.mcp.lock().expect("mcp lock poisoned").take();
        *self.functions.lock().expect("functions lock poisoned") = None;
        if let Some(registry) = registry {
            registry.disconnect_sessions().await;
        }
    }

    /// Runs one conversation and returns the up-call chunk stream.
    pub fn stream(self: Arc<Self>, messages: Vec<Message>) -> ReceiverStream<StreamChunk> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.run(messages, tx).await;
        });
        ReceiverStream::new(rx)
    }

    /// Loop body; sends chunks until done or the receiver goes away
    /// (cancellation propagates by dropping the stream).
    pub async fn run(&self, messages: Vec<Message>, tx: mpsc::Sender<StreamChunk>) {
        self.setup_mcp_tools().await;

        if self.is_permanently_blocked() && !self.blocked_notified.swap(true, Ordering::SeqCst) {
            let chunk = StreamChunk::mcp_status(
                McpStatusKind::McpBlocked,
                "⚠️ [MCP] All servers blocked by circuit breaker",
                "circuit_breaker",
            );
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
        let pending_connected_chunk = self.pending_connected.lock().expect("pending lock poisoned").take();
        if let Some(chunk) = pending_connected_chunk {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }

        let Some(functions) = self.functions_registry() else {
            self.stream_without_mcp(messages, &tx).await;
            return;
        };

        let mut current = trim_history(messages, self.options.max_history);
        let mut merged_tools = functions.to_chat_completions_tools();
        merged_tools.extend(self.options.provider_tools.iter().cloned());

        for iteration in 0..self.options.max_iterations {
            debug!(iteration = iteration + 1, max = self.options.max_iterations, "tool loop iteration");
            let params = ApiParams {
                messages: current.clone(),
                tools: merged_tools.clone(),
            };
            let stream = match self.model.stream(params).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error { error: e.to_string() }).await;
                    let _ = tx.send(StreamChunk::Done).await;
                    return;
                }
            };

            let (calls, content, completed, finish_reason) =
                match consume_model_stream(stream, &tx).await {
                    Some(turn) => turn,
                    None => return, // receiver gone or stream error already reported
                };

            let mut calls = calls;
            if finish_reason.as_deref() == Some("stop") && !calls.is_empty() {
                warn!("finish reason 'stop' with partial tool calls - treating as content");
                calls.clear();
            }

            if calls.is_empty() {
                if completed {
                    let message = Message::assistant(content);
                    let _ = tx
                        .send(StreamChunk::CompleteMessage {
                            message: serde_json::to_value(&message).unwrap_or(Value::Null),
                        })
                        .await;
                    let _ = tx.send(StreamChunk::Done).await;
                    return;
                }
                continue;
            }

            // Workflow tools (vote, new_answer, ...) are not ours to execute:
            // append the assistant message and hand the batch upward.
            let non_mcp: Vec<&ToolCallPayload> =
                calls.iter().filter(|c| !functions.contains(&c.name)).collect();
            if !non_mcp.is_empty() {
                debug!(
                    tools = ?non_mcp.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "non-MCP tool calls detected, yielding to orchestrator"
                );
                current.push(Message::assistant_tool_calls(calls.clone()));
                let _ = tx.send(StreamChunk::ToolCalls { tool_calls: calls }).await;
                let _ = tx.send(StreamChunk::Done).await;
                return;
            }

            // Breaker gate before dispatching the batch.
            let all_open = self
                .specs
                .iter()
                .all(|spec| self.breaker.should_skip(&spec.name));
            if all_open && !self.specs.is_empty() {
                if !self.blocked_notified.swap(true, Ordering::SeqCst) {
                    let chunk = StreamChunk::mcp_status(
                        McpStatusKind::McpBlocked,
                        "⚠️ [MCP] All servers blocked by circuit breaker",
                        "circuit_breaker",
                    );
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(StreamChunk::Done).await;
                return;
            }

            current.push(Message::assistant_tool_calls(calls.clone()));

            // Sequential execution keeps conversation history deterministic.
            for call in &calls {
                let chunk = StreamChunk::mcp_status(
                    McpStatusKind::McpToolCalled,
                    format!("🔧 [MCP Tool] Calling {}...", call.name),
                    format!("mcp_{}", call.name),
                );
                if tx.send(chunk).await.is_err() {
                    return;
                }

                let result = self
                    .execute_with_retry(&functions, &call.name, &call.arguments)
                    .await;

                let chunk = StreamChunk::mcp_status(
                    McpStatusKind::McpToolResponse,
                    format!("✅ [MCP Tool] {} completed", call.name),
                    format!("mcp_{}", call.name),
                );
                if tx.send(chunk).await.is_err() {
                    return;
                }

                current.push(Message::tool_result(call.id.clone(), result));
                current = trim_history(current, self.options.max_history);
            }
        }

        warn!(max = self.options.max_iterations, "max tool-loop iterations reached");
        let _ = tx.send(StreamChunk::Done).await;
    }

    /// Simple streaming fallback when MCP is unavailable: one model turn with
    /// provider tools only, with a one-time notification chunk.
    async fn stream_without_mcp(&self, messages: Vec<Message>, tx: &mpsc::Sender<StreamChunk>) {
        if !self.specs.is_empty() && !self.no_mcp_notified.swap(true, Ordering::SeqCst) {
            let chunk = StreamChunk::content("\n⚠️  MCP tools unavailable; continuing without MCP tools\n");
            if tx.send(chunk).await.is_err() {
                return;
            }
        }

        let params = ApiParams {
            messages: trim_history(messages, self.options.max_history),
            tools: self.options.provider_tools.clone(),
        };
        let stream = match self.model.stream(params).await {
            Ok(s) => s,
            Err(e) => {
                let _ = tx.send(StreamChunk::Error { error: e.to_string() }).await;
                let _ = tx.send(StreamChunk::Done).await;
                return;
            }
        };
        let Some((calls, content, completed, _)) = consume_model_stream(stream, tx).await else {
            return;
        };
        if !calls.is_empty() {
            let _ = tx.send(StreamChunk::ToolCalls { tool_calls: calls }).await;
        } else if completed && !content.is_empty() {
            let message = Message::assistant(content);
            let _ = tx
                .send(StreamChunk::CompleteMessage {
                    message: serde_json::to_value(&message).unwrap_or(Value::Null),
                })
                .await;
        }
        let _ = tx.send(StreamChunk::Done).await;
    }

    /// Executes one MCP function with exponential backoff and jitter.
    ///
    /// Never errors: the result string is either the tool output or a
    /// structured error payload the model can reason about.
    async fn execute_with_retry(
        &self,
        functions: &FunctionRegistry,
        name: &str,
        arguments_json: &str,
    ) -> String {
        let server = server_from_external_name(name).map(str::to_string);
        let record_failure = |server: &Option<String>| {
            if let Some(server) = server {
                self.breaker.record_failure(server);
            }
        };

        for attempt in 0..=self.options.max_retries {
            match functions.call(name, arguments_json).await {
                Ok(output) => {
                    if attempt > 0 {
                        info!(function = name, attempt, "function succeeded on retry");
                    }
                    if let Some(server) = &server {
                        self.breaker.record_success(server);
                    }
                    if output.text.is_empty() {
                        return output.raw.to_string();
                    }
                    return output.text;
                }
                Err(e) if e.is_auth_or_resource() => {
                    warn!(function = name, error = %e, "auth/resource error, not retrying");
                    record_failure(&server);
                    return json!({
                        "error": e.to_string(),
                        "type": "auth_resource_error",
                        "function": name,
                    })
                    .to_string();
                }
                Err(e) if e.is_transient() && attempt < self.options.max_retries => {
                    let delay = retry_delay(attempt, self.options.retry_base_delay);
                    warn!(function = name, attempt = attempt + 1, error = %e, ?delay, "transient error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(function = name, error = %e, "function failed");
                    record_failure(&server);
                    return json!({
                        "error": e.to_string(),
                        "type": "execution_error",
                        "function": name,
                    })
                    .to_string();
                }
            }
        }
        json!({
            "error": "Max retries exceeded",
            "type": "retry_exhausted",
            "function": name,
        })
        .to_string()
    }
}

/// Consumes one model stream, forwarding content/reasoning chunks and
/// accumulating tool-call fragments.
///
/// Returns `(calls, aggregated_content, completed, finish_reason)`, or `None`
/// when the receiver went away or the stream errored (already reported).
async fn consume_model_stream(
    mut stream: crate::model::ModelEventStream,
    tx: &mpsc::Sender<StreamChunk>,
) -> Option<(Vec<ToolCallPayload>, String, bool, Option<String>)> {
    let mut accumulator = ToolCallAccumulator::new();
    let mut content = String::new();
    let mut completed = false;
    let mut finish_reason = None;

    while let Some(event) = stream.next().await {
        match event {
            Ok(ModelEvent::Content(delta)) => {
                content.push_str(&delta);
                if tx.send(StreamChunk::content(delta)).await.is_err() {
                    return None;
                }
            }
            Ok(ModelEvent::Reasoning(delta)) => {
                if tx.send(StreamChunk::Reasoning { delta }).await.is_err() {
                    return None;
                }
            }
            Ok(ModelEvent::ReasoningDone) => {
                if tx.send(StreamChunk::ReasoningDone).await.is_err() {
                    return None;
                }
            }
            Ok(ModelEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            }) => {
                accumulator.push(index, id, name, &arguments);
            }
            Ok(ModelEvent::Completed {
                finish_reason: reason,
            }) => {
                completed = true;
                finish_reason = reason;
                break;
            }
            Err(e) => {
                let _ = tx.send(StreamChunk::Error { error: e.to_string() }).await;
                let _ = tx.send(StreamChunk::Done).await;
                return None;
            }
        }
    }

    Some((accumulator.finish(), content, completed, finish_reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpError;
    use crate::function::Function;
    use crate::mcp::session::ToolOutput;
    use crate::model::MockModel;
    use std::sync::atomic::AtomicU32;

    fn collect(chunks: ReceiverStream<StreamChunk>) -> impl std::future::Future<Output = Vec<StreamChunk>> {
        use futures_util::StreamExt;
        chunks.collect::<Vec<_>>()
    }

    fn static_function(name: &str, reply: &'static str) -> Function {
        Function::new(
            name,
            "test function",
            json!({"type": "object"}),
            Arc::new(move |_input: String| {
                Box::pin(async move {
                    Ok(ToolOutput {
                        text: reply.to_string(),
                        raw: Value::Null,
                    })
                })
            }),
        )
    }

    fn runner_with(model: Arc<MockModel>, functions: FunctionRegistry) -> Arc<BackendRunner> {
        Arc::new(
            BackendRunner::new(model, Vec::new(), RunnerOptions::default())
                .with_function_registry(functions),
        )
    }

    #[tokio::test]
    async fn plain_text_turn_ends_with_complete_message_and_done() {
        let model = Arc::new(MockModel::new());
        model.push_text_turn("hello there");
        let runner = runner_with(Arc::clone(&model), FunctionRegistry::new());

        let chunks = collect(runner.stream(vec![Message::user("hi")])).await;
        assert!(matches!(&chunks[0], StreamChunk::Content { content } if content == "hello there"));
        assert!(matches!(&chunks[1], StreamChunk::CompleteMessage { .. }));
        assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
    }

    #[tokio::test]
    async fn tool_call_executes_and_second_turn_answers() {
        let model = Arc::new(MockModel::new());
        model.push_tool_call_turn("call_1", "mcp__fs__read_file", r#"{"path":"/w/h.txt"}"#);
        model.push_text_turn("The file says hi.");

        let mut functions = FunctionRegistry::new();
        functions.insert(static_function("mcp__fs__read_file", "hi"));
        let runner = runner_with(Arc::clone(&model), functions);

        let chunks = collect(runner.stream(vec![Message::user("read it")])).await;

        let statuses: Vec<&McpStatusKind> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::McpStatus { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![&McpStatusKind::McpToolCalled, &McpStatusKind::McpToolResponse]);
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::Content { content } if content == "The file says hi.")));
        assert!(matches!(chunks.last(), Some(StreamChunk::Done)));

        // Second model call saw the assistant tool-call message and its result.
        let recorded = model.recorded_calls();
        assert_eq!(recorded.len(), 2);
        let second = &recorded[1].messages;
        assert!(second
            .iter()
            .any(|m| matches!(m, Message::Assistant { tool_calls, .. } if !tool_calls.is_empty())));
        assert!(second
            .iter()
            .any(|m| matches!(m, Message::Tool { call_id, content } if call_id == "call_1" && content == "hi")));
    }

    #[tokio::test]
    async fn workflow_tool_passes_through_to_orchestrator() {
        let model = Arc::new(MockModel::new());
        model.push_tool_call_turn("call_v", "vote", r#"{"agent":"a1"}"#);

        let mut functions = FunctionRegistry::new();
        functions.insert(static_function("mcp__fs__read_file", "hi"));
        let runner = runner_with(Arc::clone(&model), functions);

        let chunks = collect(runner.stream(vec![Message::user("choose")])).await;
        assert_eq!(chunks.len(), 2);
        match &chunks[0] {
            StreamChunk::ToolCalls { tool_calls } => {
                assert_eq!(tool_calls.len(), 1);
                assert_eq!(tool_calls[0].name, "vote");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(chunks[1], StreamChunk::Done));
        // Only one model turn: the loop yielded instead of executing `vote`.
        assert_eq!(model.recorded_calls().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let model = Arc::new(MockModel::new());
        model.push_tool_call_turn("c1", "mcp__srv__flaky", "{}");
        model.push_text_turn("done");

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let flaky = Function::new(
            "mcp__srv__flaky",
            "fails twice then succeeds",
            json!({"type": "object"}),
            Arc::new(move |_input: String| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(McpError::connection("connection reset"))
                    } else {
                        Ok(ToolOutput {
                            text: "ok".into(),
                            raw: Value::Null,
                        })
                    }
                })
            }),
        );
        let mut functions = FunctionRegistry::new();
        functions.insert(flaky);

        let options = RunnerOptions {
            retry_base_delay: Duration::from_millis(10),
            ..RunnerOptions::default()
        };
        let runner = Arc::new(
            BackendRunner::new(Arc::clone(&model) as Arc<dyn ModelClient>, vec![], options)
                .with_function_registry(functions),
        );

        let started = std::time::Instant::now();
        let chunks = collect(Arc::clone(&runner).stream(vec![Message::user("go")])).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // base + 2*base plus jitter at minimum
        assert!(started.elapsed() >= Duration::from_millis(30));
        // Exactly one called/completed pair, then the answer.
        let called = chunks
            .iter()
            .filter(|c| matches!(c, StreamChunk::McpStatus { status: McpStatusKind::McpToolCalled, .. }))
            .count();
        assert_eq!(called, 1);
        assert_eq!(runner.breaker().server_status("srv").0, 0);
    }

    #[tokio::test]
    async fn permission_denial_becomes_tool_result_the_model_observes() {
        let model = Arc::new(MockModel::new());
        model.push_tool_call_turn("c1", "mcp__fs__write_file", r#"{"path":"/ctx/x"}"#);
        model.push_text_turn("I cannot write there.");

        let denying = Function::new(
            "mcp__fs__write_file",
            "write",
            json!({"type": "object"}),
            Arc::new(|_input: String| {
                Box::pin(async move {
                    Err::<ToolOutput, _>(McpError::validation(
                        "No write permission for '/ctx/x' (read-only context path)",
                    ))
                })
            }),
        );
        let mut functions = FunctionRegistry::new();
        functions.insert(denying);
        let runner = runner_with(Arc::clone(&model), functions);

        let _ = collect(runner.stream(vec![Message::user("write")])).await;
        let second = &model.recorded_calls()[1].messages;
        let tool_result = second
            .iter()
            .find_map(|m| match m {
                Message::Tool { content, .. } => Some(content.clone()),
                _ => None,
            })
            .expect("tool result appended");
        assert!(tool_result.contains("No write permission for '/ctx/x'"));
        assert!(tool_result.contains("execution_error"));
    }

    #[tokio::test]
    async fn stop_finish_reason_discards_partial_tool_calls() {
        let model = Arc::new(MockModel::new());
        model.push_turn(vec![
            ModelEvent::Content("half ".into()),
            ModelEvent::ToolCallDelta {
                index: 0,
                id: Some("c".into()),
                name: Some("mcp__fs__read_file".into()),
                arguments: "{}".into(),
            },
            ModelEvent::Completed {
                finish_reason: Some("stop".into()),
            },
        ]);
        let mut functions = FunctionRegistry::new();
        functions.insert(static_function("mcp__fs__read_file", "hi"));
        let runner = runner_with(Arc::clone(&model), functions);

        let chunks = collect(runner.stream(vec![Message::user("go")])).await;
        // Treated as a natural stop: no tool status chunks at all.
        assert!(!chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::McpStatus { .. })));
        assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
        assert_eq!(model.recorded_calls().len(), 1);
    }

    #[tokio::test]
    async fn max_iterations_bounds_the_loop() {
        let model = Arc::new(MockModel::new());
        for _ in 0..20 {
            model.push_tool_call_turn("c", "mcp__fs__read_file", "{}");
        }
        let mut functions = FunctionRegistry::new();
        functions.insert(static_function("mcp__fs__read_file", "hi"));
        let options = RunnerOptions {
            max_iterations: 3,
            ..RunnerOptions::default()
        };
        let runner = Arc::new(
            BackendRunner::new(Arc::clone(&model) as Arc<dyn ModelClient>, vec![], options)
                .with_function_registry(functions),
        );

        let chunks = collect(runner.stream(vec![Message::user("go")])).await;
        assert!(matches!(chunks.last(), Some(StreamChunk::Done)));
        assert_eq!(model.recorded_calls().len(), 3);
    }

    #[tokio::test]
    async fn history_is_trimmed_with_system_preserved() {
        let model = Arc::new(MockModel::new());
        model.push_tool_call_turn("c1", "mcp__fs__read_file", "{}");
        model.push_text_turn("ok");

        let mut functions = FunctionRegistry::new();
        functions.insert(static_function("mcp__fs__read_file", "hi"));
        let options = RunnerOptions {
            max_history: 10,
            ..RunnerOptions::default()
        };
        let runner = Arc::new(
            BackendRunner::new(Arc::clone(&model) as Arc<dyn ModelClient>, vec![], options)
                .with_function_registry(functions),
        );

        let mut messages = vec![Message::system("sys prompt")];
        for i in 0..30 {
            messages.push(Message::user(format!("m{}", i)));
        }
        let _ = collect(runner.stream(messages)).await;

        for call in model.recorded_calls() {
            assert!(call.messages.len() <= 10);
            assert_eq!(call.messages[0], Message::system("sys prompt"));
        }
        // The most recent tool result survived the trim.
        let second = &model.recorded_calls()[1].messages;
        assert!(matches!(second.last(), Some(Message::Tool { .. })));
    }

    #[test]
    fn external_name_parsing() {
        assert_eq!(server_from_external_name("mcp__fs__read_file"), Some("fs"));
        assert_eq!(
            server_from_external_name("mcp__workspace_tools__copy_file"),
            Some("workspace_tools")
        );
        assert_eq!(server_from_external_name("vote"), None);
    }
}
