//! Multi-session registry: supervises many MCP sessions, namespaces their
//! tools by server, and dispatches namespaced calls to the right session.
//!
//! Tool names collide across servers all the time (`read_file` everywhere);
//! the external name `mcp__<server>__<tool>` resolves that. No two registry
//! entries share an external name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::McpError;
use crate::mcp::security;
use crate::mcp::session::{McpSession, SessionState, ToolDescriptor, ToolOutput};
use crate::mcp::spec::ServerSpec;

/// Registry over all connected sessions.
///
/// Built by [`connect_all`](Self::connect_all); read-only at steady state
/// (sessions are internally synchronized), so it is shared as a plain `Arc`.
pub struct MultiServerRegistry {
    sessions: HashMap<String, Arc<McpSession>>,
    /// external name → descriptor (post-namespacing).
    tools: HashMap<String, ToolDescriptor>,
    /// external name → (server, server-local name).
    tool_routes: HashMap<String, (String, String)>,
    /// resource URI → server name (first declaring session wins).
    resource_routes: HashMap<String, String>,
    /// `<server>__<prompt>` → (server, local prompt name).
    prompt_routes: HashMap<String, (String, String)>,
}

impl std::fmt::Debug for MultiServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiServerRegistry")
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .field("tool_routes", &self.tool_routes)
            .field("resource_routes", &self.resource_routes)
            .field("prompt_routes", &self.prompt_routes)
            .finish()
    }
}

impl MultiServerRegistry {
    /// Validates every spec, connects sessions concurrently and registers the
    /// namespaced tools of each session that came up. Partial success is
    /// acceptable; total failure is an error.
    ///
    /// `allowed_tools` / `exclude_tools` are registry-wide filters applied on
    /// top of each spec's own lists.
    pub async fn connect_all(
        specs: &[ServerSpec],
        timeout: Duration,
        allowed_tools: Option<&[String]>,
        exclude_tools: Option<&[String]>,
    ) -> Result<Self, McpError> {
        let mut seen = std::collections::HashSet::new();
        for spec in specs {
            security::validate_server_spec(spec)?;
            if !seen.insert(spec.name.clone()) {
                return Err(McpError::config(format!(
                    "duplicate server name: {}",
                    spec.name
                )));
            }
        }

        let connects = specs.iter().map(|spec| {
            let session = Arc::new(
                McpSession::new(spec.clone(), timeout).with_filters(allowed_tools, exclude_tools),
            );
            async move {
                let result = session.connect().await;
                (session, result)
            }
        });

        let mut registry = Self {
            sessions: HashMap::new(),
            tools: HashMap::new(),
            tool_routes: HashMap::new(),
            resource_routes: HashMap::new(),
            prompt_routes: HashMap::new(),
        };

        for (session, result) in join_all(connects).await {
            let server_name = session.name().to_string();
            match result {
                Ok(()) => {
                    registry.register_session(session);
                    info!(server = %server_name, "connected to server");
                }
                Err(e) => {
                    warn!(server = %server_name, error = %e, "failed to connect to server");
                }
            }
        }

        if registry.sessions.is_empty() && !specs.is_empty() {
            return Err(McpError::connection("failed to connect to any MCP server"));
        }
        info!(
            servers = registry.sessions.len(),
            tools = registry.tools.len(),
            "multi-server registry ready"
        );
        Ok(registry)
    }

    fn register_session(&mut self, session: Arc<McpSession>) {
        let server_name = session.name().to_string();
        for (local_name, descriptor) in session.tool_descriptors() {
            let external = match security::sanitize_tool_name(&local_name, &server_name) {
                Ok(external) => external,
                Err(e) => {
                    warn!(server = %server_name, tool = %local_name, error = %e, "skipping tool with invalid name");
                    continue;
                }
            };
            self.tools.insert(external.clone(), descriptor);
            self.tool_routes
                .insert(external, (server_name.clone(), local_name));
        }
        for uri in session.resource_uris() {
            self.resource_routes
                .entry(uri)
                .or_insert_with(|| server_name.clone());
        }
        for prompt in session.prompt_names() {
            self.prompt_routes.insert(
                format!("{}__{}", server_name, prompt),
                (server_name.clone(), prompt),
            );
        }
        self.sessions.insert(server_name, session);
    }

    /// Dispatches one namespaced tool call to its session.
    pub async fn call_tool(&self, external_name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let (server, local) = self.tool_routes.get(external_name).ok_or_else(|| {
            McpError::other(format!("tool '{}' not available", external_name))
        })?;
        let session = self.sessions.get(server).ok_or_else(|| {
            McpError::other(format!("server '{}' not connected", server))
        })?;
        session.call_tool(local, arguments).await
    }

    /// Reads a resource from the first session that declares its URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let server = self.resource_routes.get(uri).ok_or_else(|| {
            McpError::other(format!("resource '{}' not available", uri))
        })?;
        let session = self.sessions.get(server).ok_or_else(|| {
            McpError::other(format!("server '{}' not connected", server))
        })?;
        session.read_resource(uri).await
    }

    /// Fetches a prompt. Prefixed names (`<server>__<prompt>`) resolve by
    /// prefix first; bare names dispatch to the first session declaring them.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        if let Some((server, local)) = self.prompt_routes.get(name) {
            let session = self.sessions.get(server).ok_or_else(|| {
                McpError::other(format!("server '{}' not connected", server))
            })?;
            return session.get_prompt(local, arguments).await;
        }
        for session in self.sessions.values() {
            if session.prompt_names().iter().any(|p| p == name) {
                return session.get_prompt(name, arguments).await;
            }
        }
        Err(McpError::other(format!("prompt '{}' not available", name)))
    }

    /// Concurrent disconnect of every session; per-session errors are logged,
    /// never propagated. Disconnecting is idempotent, so shared holders of the
    /// registry may call this while entries are still referenced elsewhere.
    pub async fn disconnect_sessions(&self) {
        let disconnects = self
            .sessions
            .values()
            .map(|session| {
                let session = Arc::clone(session);
                async move {
                    session.disconnect().await;
                    session.name().to_string()
                }
            })
            .collect::<Vec<_>>();
        for name in join_all(disconnects).await {
            if self
                .sessions
                .get(&name)
                .map(|s| s.state() != SessionState::NotConnected)
                .unwrap_or(false)
            {
                warn!(server = %name, "session did not reach NotConnected on disconnect");
            }
        }
    }

    /// [`disconnect_sessions`](Self::disconnect_sessions) plus emptying every
    /// registry map.
    pub async fn disconnect_all(&mut self) {
        self.disconnect_sessions().await;
        self.sessions.clear();
        self.tools.clear();
        self.tool_routes.clear();
        self.resource_routes.clear();
        self.prompt_routes.clear();
    }

    /// Health-checks every session concurrently.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let checks = self.sessions.iter().map(|(name, session)| {
            let name = name.clone();
            let session = Arc::clone(session);
            async move { (name, session.health_check().await) }
        });
        let results: HashMap<String, bool> = join_all(checks).await.into_iter().collect();
        let healthy = results.values().filter(|h| **h).count();
        info!(healthy, total = results.len(), "health check completed");
        results
    }

    /// Reconnects every session whose health check fails. Returns per-server
    /// success.
    pub async fn reconnect_failed(&self, max_retries: u32, retry_delay: Duration) -> HashMap<String, bool> {
        let health = self.health_check_all().await;
        let mut results = HashMap::new();
        for (name, healthy) in health {
            if healthy {
                results.insert(name, true);
                continue;
            }
            let Some(session) = self.sessions.get(&name) else {
                results.insert(name, false);
                continue;
            };
            info!(server = %name, "reconnecting unhealthy server");
            results.insert(name, session.reconnect(max_retries, retry_delay).await);
        }
        results
    }

    pub fn server_names(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// All external (namespaced) tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// External tool name → descriptor map.
    pub fn tools(&self) -> &HashMap<String, ToolDescriptor> {
        &self.tools
    }

    /// The server a namespaced tool routes to, if registered.
    pub fn server_for_tool(&self, external_name: &str) -> Option<&str> {
        self.tool_routes
            .get(external_name)
            .map(|(server, _)| server.as_str())
    }

    /// External names of all tools registered for one server.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<String> {
        self.tool_routes
            .iter()
            .filter(|(_, (server, _))| server == server_name)
            .map(|(external, _)| external.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        !self.sessions.is_empty()
    }
}
