//! MCP session: one server, one transport, a well-defined state machine.
//!
//! The transport is opened and closed by a dedicated supervisor task: a
//! `disconnect` is a cancellation signal delivered to that task, never a
//! cross-task close. Tool calls run against the shared transport handle and
//! fail only the in-flight request; the session stays usable unless the
//! transport itself is dead.
//!
//! **Interaction**: created and supervised by
//! [`MultiServerRegistry`](crate::mcp::registry::MultiServerRegistry); the
//! registry namespaces this session's tools for the function registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::mcp::jsonrpc::{initialize_params, ResultMessage};
use crate::mcp::security;
use crate::mcp::spec::ServerSpec;
use crate::mcp::transport::Transport;

/// Deadline used for health checks.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle states; transitions are linearizable per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotConnected,
    Connecting,
    Ready,
    Disconnecting,
    Failed,
}

/// One tool as discovered from `tools/list`, keyed by server-local name.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// One resource as discovered from `resources/list`.
#[derive(Clone, Debug)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: Option<String>,
}

/// One prompt as discovered from `prompts/list`.
#[derive(Clone, Debug)]
pub struct PromptDescriptor {
    pub name: String,
    pub description: Option<String>,
}

/// Result of one tool execution: joined text blocks plus the raw result value.
#[derive(Clone, Debug)]
pub struct ToolOutput {
    pub text: String,
    pub raw: Value,
}

#[derive(Default)]
struct SharedState {
    transport: StdMutex<Option<Arc<Transport>>>,
    tools: StdMutex<HashMap<String, ToolDescriptor>>,
    resources: StdMutex<HashMap<String, ResourceDescriptor>>,
    prompts: StdMutex<HashMap<String, PromptDescriptor>>,
}

/// A live connection to one MCP server.
pub struct McpSession {
    spec: ServerSpec,
    timeout: Duration,
    /// Merged allow filter: spec `allowed_tools` plus any registry-wide list.
    allowed_tools: Vec<String>,
    exclude_tools: Vec<String>,
    stderr_verbose: bool,
    state: Arc<StdMutex<SessionState>>,
    shared: Arc<SharedState>,
    cancel: StdMutex<Option<CancellationToken>>,
    supervisor: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpSession {
    /// Builds a session from a validated spec. Does not connect.
    pub fn new(spec: ServerSpec, timeout: Duration) -> Self {
        let allowed_tools = spec.allowed_tools.clone();
        let exclude_tools = spec.exclude_tools.clone();
        Self {
            spec,
            timeout,
            allowed_tools,
            exclude_tools,
            stderr_verbose: false,
            state: Arc::new(StdMutex::new(SessionState::NotConnected)),
            shared: Arc::new(SharedState::default()),
            cancel: StdMutex::new(None),
            supervisor: TokioMutex::new(None),
        }
    }

    /// Extends the tool filters with registry-wide lists.
    pub fn with_filters(
        mut self,
        allowed_tools: Option<&[String]>,
        exclude_tools: Option<&[String]>,
    ) -> Self {
        if let Some(allowed) = allowed_tools {
            self.allowed_tools.extend(allowed.iter().cloned());
        }
        if let Some(excluded) = exclude_tools {
            self.exclude_tools.extend(excluded.iter().cloned());
        }
        self
    }

    /// When true, the spawned server's stderr is inherited instead of
    /// discarded.
    pub fn with_stderr_verbose(mut self, verbose: bool) -> Self {
        self.stderr_verbose = verbose;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Server-local names of the discovered (post-filter) tools.
    pub fn tool_names(&self) -> Vec<String> {
        self.shared
            .tools
            .lock()
            .expect("tools lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn tool_descriptors(&self) -> HashMap<String, ToolDescriptor> {
        self.shared.tools.lock().expect("tools lock poisoned").clone()
    }

    pub fn resource_uris(&self) -> Vec<String> {
        self.shared
            .resources
            .lock()
            .expect("resources lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.shared
            .prompts
            .lock()
            .expect("prompts lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    fn transport(&self) -> Result<Arc<Transport>, McpError> {
        self.shared
            .transport
            .lock()
            .expect("transport lock poisoned")
            .clone()
            .ok_or_else(|| {
                McpError::connection("no active session")
                    .with_context("server_name", self.spec.name.clone())
            })
    }

    /// Connects: opens the transport, performs the `initialize` handshake,
    /// discovers tools/resources/prompts, applies filters and transitions to
    /// Ready. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.state() == SessionState::Ready {
            debug!(server = %self.spec.name, "already connected");
            return Ok(());
        }
        self.set_state(SessionState::Connecting);
        info!(server = %self.spec.name, transport = self.spec.transport_kind(), "connecting to MCP server");

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), McpError>>();
        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = Some(token.clone());

        let spec = self.spec.clone();
        let timeout = self.timeout;
        let allowed = self.allowed_tools.clone();
        let excluded = self.exclude_tools.clone();
        let stderr_verbose = self.stderr_verbose;
        let shared = Arc::clone(&self.shared);
        let state = Arc::clone(&self.state);

        // Supervisor task: the transport's open/close pair lives here and
        // nowhere else.
        let handle = tokio::spawn(async move {
            let setup = async {
                let transport = Transport::open(&spec, stderr_verbose)?;
                let init = transport
                    .request("initialize", initialize_params(), timeout)
                    .await?;
                if let Some(err) = init.error {
                    return Err(McpError::connection(format!("initialize: {}", err.message))
                        .with_context("server_name", spec.name.clone()));
                }
                transport
                    .notify("notifications/initialized", Some(json!({})))
                    .await?;
                discover(&transport, timeout, &allowed, &excluded).await.map(
                    |(tools, resources, prompts)| (Arc::new(transport), tools, resources, prompts),
                )
            }
            .await;

            let transport = match setup {
                Ok((transport, tools, resources, prompts)) => {
                    info!(
                        server = %spec.name,
                        tools = tools.len(),
                        resources = resources.len(),
                        prompts = prompts.len(),
                        "discovered server capabilities"
                    );
                    *shared.tools.lock().expect("tools lock poisoned") = tools;
                    *shared.resources.lock().expect("resources lock poisoned") = resources;
                    *shared.prompts.lock().expect("prompts lock poisoned") = prompts;
                    *shared.transport.lock().expect("transport lock poisoned") =
                        Some(Arc::clone(&transport));
                    *state.lock().expect("state lock poisoned") = SessionState::Ready;
                    let _ = ready_tx.send(Ok(()));
                    transport
                }
                Err(e) => {
                    *state.lock().expect("state lock poisoned") = SessionState::Failed;
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Hold the transport open until disconnect is requested.
            token.cancelled().await;
            *state.lock().expect("state lock poisoned") = SessionState::Disconnecting;
            transport.close().await;
            *shared.transport.lock().expect("transport lock poisoned") = None;
            shared.tools.lock().expect("tools lock poisoned").clear();
            shared
                .resources
                .lock()
                .expect("resources lock poisoned")
                .clear();
            shared.prompts.lock().expect("prompts lock poisoned").clear();
            *state.lock().expect("state lock poisoned") = SessionState::NotConnected;
        });
        *self.supervisor.lock().await = Some(handle);

        match ready_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect().await;
                self.set_state(SessionState::Failed);
                Err(e)
            }
            Err(_) => {
                self.disconnect().await;
                self.set_state(SessionState::Failed);
                Err(McpError::connection(format!(
                    "failed to connect to MCP server {}: supervisor exited early",
                    self.spec.name
                )))
            }
        }
    }

    /// Calls one tool by server-local name, bounded by the session deadline.
    ///
    /// Rejected unless the session is Ready and the tool was discovered.
    /// Arguments must be an object within the size/depth bounds.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        if self.state() != SessionState::Ready {
            return Err(McpError::connection("no active session")
                .with_context("server_name", self.spec.name.clone())
                .with_context("tool_name", tool_name.to_string()));
        }
        let known = {
            let tools = self.shared.tools.lock().expect("tools lock poisoned");
            tools.contains_key(tool_name)
        };
        if !known {
            let available = self.tool_names().join(", ");
            return Err(McpError::other(format!(
                "tool '{}' not available on server '{}'",
                tool_name, self.spec.name
            ))
            .with_context("available_tools", available));
        }

        security::validate_tool_arguments(&arguments).map_err(|e| {
            e.with_context("tool_name", tool_name.to_string())
                .with_context("server_name", self.spec.name.clone())
        })?;

        debug!(server = %self.spec.name, tool = tool_name, "calling tool");
        let transport = self.transport()?;
        let params = json!({ "name": tool_name, "arguments": arguments });
        let result = transport
            .request("tools/call", params, self.timeout)
            .await
            .map_err(|e| match e {
                McpError::Timeout { timeout, .. } => {
                    McpError::timeout(format!("call_tool({})", tool_name), timeout)
                        .with_context("server_name", self.spec.name.clone())
                }
                other => other,
            })?;
        parse_tool_result(result, tool_name, &self.spec.name)
    }

    /// Reads one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let transport = self.transport()?;
        let result = transport
            .request("resources/read", json!({ "uri": uri }), self.timeout)
            .await?;
        if let Some(err) = result.error {
            return Err(McpError::server(format!("resource read failed: {}", err.message), Some(err.code)));
        }
        Ok(result.result.unwrap_or(Value::Null))
    }

    /// Fetches one prompt template.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        let transport = self.transport()?;
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        let result = transport
            .request("prompts/get", params, self.timeout)
            .await?;
        if let Some(err) = result.error {
            return Err(McpError::server(format!("prompt get failed: {}", err.message), Some(err.code)));
        }
        Ok(result.result.unwrap_or(Value::Null))
    }

    /// Cheap liveness probe: `tools/list` with a short deadline.
    pub async fn health_check(&self) -> bool {
        if self.state() != SessionState::Ready {
            warn!(server = %self.spec.name, "health check failed: not connected");
            return false;
        }
        let Ok(transport) = self.transport() else {
            return false;
        };
        match transport
            .request("tools/list", json!({}), HEALTH_CHECK_TIMEOUT)
            .await
        {
            Ok(result) => result.error.is_none(),
            Err(e) => {
                warn!(server = %self.spec.name, error = %e, "health check failed");
                false
            }
        }
    }

    /// Disconnect, back off progressively, reconnect; succeeds when a health
    /// check passes.
    pub async fn reconnect(&self, max_retries: u32, retry_delay: Duration) -> bool {
        info!(server = %self.spec.name, max_retries, "attempting reconnect");
        for attempt in 0..max_retries {
            self.disconnect().await;
            if attempt > 0 {
                tokio::time::sleep(retry_delay.mul_f64(attempt as f64)).await;
            }
            match self.connect().await {
                Ok(()) if self.health_check().await => {
                    info!(server = %self.spec.name, attempt = attempt + 1, "reconnected");
                    return true;
                }
                Ok(()) => {
                    warn!(server = %self.spec.name, attempt = attempt + 1, "reconnect failed health check");
                }
                Err(e) => {
                    warn!(server = %self.spec.name, attempt = attempt + 1, error = %e, "reconnect attempt failed");
                }
            }
        }
        warn!(server = %self.spec.name, "failed to reconnect");
        false
    }

    /// Signals the supervisor task to exit and waits for it; all transport
    /// resources are released in the task that acquired them. Idempotent;
    /// a no-op on a NotConnected session.
    pub async fn disconnect(&self) {
        let token = self.cancel.lock().expect("cancel lock poisoned").take();
        if let Some(token) = token {
            token.cancel();
        }
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.set_state(SessionState::NotConnected);
    }
}

/// Runs the three discovery calls. `resources/list` and `prompts/list` may be
/// legitimately unsupported; those come back empty.
async fn discover(
    transport: &Transport,
    timeout: Duration,
    allowed: &[String],
    excluded: &[String],
) -> Result<
    (
        HashMap<String, ToolDescriptor>,
        HashMap<String, ResourceDescriptor>,
        HashMap<String, PromptDescriptor>,
    ),
    McpError,
> {
    let tools_result = transport.request("tools/list", json!({}), timeout).await?;
    if let Some(err) = tools_result.error {
        return Err(McpError::server(
            format!("tools/list failed: {}", err.message),
            Some(err.code),
        ));
    }
    let mut tools = HashMap::new();
    if let Some(items) = tools_result
        .result
        .as_ref()
        .and_then(|r| r.get("tools"))
        .and_then(Value::as_array)
    {
        for item in items {
            let Some(name) = item.get("name").and_then(Value::as_str) else {
                continue;
            };
            // Keep a tool iff not excluded and (no allowlist or listed).
            if excluded.iter().any(|e| e == name) {
                continue;
            }
            if !allowed.is_empty() && !allowed.iter().any(|a| a == name) {
                continue;
            }
            tools.insert(
                name.to_string(),
                ToolDescriptor {
                    name: name.to_string(),
                    description: item
                        .get("description")
                        .and_then(Value::as_str)
                        .map(String::from),
                    input_schema: item
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({})),
                },
            );
        }
    }

    let mut resources = HashMap::new();
    if let Ok(result) = transport
        .request("resources/list", json!({}), timeout)
        .await
    {
        if let Some(items) = result
            .result
            .as_ref()
            .and_then(|r| r.get("resources"))
            .and_then(Value::as_array)
        {
            for item in items {
                if let Some(uri) = item.get("uri").and_then(Value::as_str) {
                    resources.insert(
                        uri.to_string(),
                        ResourceDescriptor {
                            uri: uri.to_string(),
                            name: item.get("name").and_then(Value::as_str).map(String::from),
                        },
                    );
                }
            }
        }
    }

    let mut prompts = HashMap::new();
    if let Ok(result) = transport.request("prompts/list", json!({}), timeout).await {
        if let Some(items) = result
            .result
            .as_ref()
            .and_then(|r| r.get("prompts"))
            .and_then(Value::as_array)
        {
            for item in items {
                if let Some(name) = item.get("name").and_then(Value::as_str) {
                    prompts.insert(
                        name.to_string(),
                        PromptDescriptor {
                            name: name.to_string(),
                            description: item
                                .get("description")
                                .and_then(Value::as_str)
                                .map(String::from),
                        },
                    );
                }
            }
        }
    }

    Ok((tools, resources, prompts))
}

/// Maps a `tools/call` response into [`ToolOutput`]: JSON-RPC errors and
/// `isError` payloads become server errors; text blocks are joined, falling
/// back to `structuredContent`.
fn parse_tool_result(
    result: ResultMessage,
    tool_name: &str,
    server_name: &str,
) -> Result<ToolOutput, McpError> {
    if let Some(err) = result.error {
        return Err(
            McpError::server(format!("tool call failed: {}", err.message), Some(err.code))
                .with_context("tool_name", tool_name.to_string())
                .with_context("server_name", server_name.to_string()),
        );
    }
    let raw = result.result.unwrap_or(Value::Null);
    if raw.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = raw
            .get("content")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|b| b.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("tool returned error")
            .to_string();
        return Err(McpError::server(message, None)
            .with_context("tool_name", tool_name.to_string())
            .with_context("server_name", server_name.to_string()));
    }

    let mut parts = Vec::new();
    if let Some(blocks) = raw.get("content").and_then(Value::as_array) {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text);
                }
            }
        }
    }
    let mut text = parts.join("\n").trim().to_string();
    if text.is_empty() {
        if let Some(structured) = raw.get("structuredContent") {
            text = serde_json::to_string(structured).unwrap_or_default();
        }
    }
    Ok(ToolOutput { text, raw })
}
