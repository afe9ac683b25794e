//! Function registry: each discovered MCP tool wrapped as a callable unit,
//! with pre-call hooks that can deny an invocation before it reaches a server.
//!
//! # Main types
//!
//! - [`Function`]: name, description, JSON-Schema parameters and an entrypoint
//!   that captures its tool name by value.
//! - [`FunctionRegistry`]: lookup, global and per-function PRE_CALL hooks,
//!   provider-facing tool-format conversions.
//! - [`PermissionHook`]: global hook adapter over
//!   [`PathPermissionManager`](crate::permission::PathPermissionManager).
//!
//! The registry is write-once at setup and read-only at steady state; rebuilds
//! publish a fresh registry wholesale (copy-on-publish).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::error::McpError;
use crate::mcp::registry::MultiServerRegistry;
use crate::mcp::session::ToolOutput;
use crate::permission::PathPermissionManager;

/// Entrypoint signature: raw JSON arguments string in, tool output out.
pub type Entrypoint =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<ToolOutput, McpError>> + Send + Sync>;

/// Executable wrapper over one discovered MCP tool, exposed to the model under
/// its namespaced external name.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub description: String,
    /// JSON-Schema object for the tool's arguments.
    pub parameters: Value,
    entrypoint: Entrypoint,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        entrypoint: Entrypoint,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            entrypoint,
        }
    }

    /// Invokes the entrypoint with the raw JSON arguments string.
    pub async fn call(&self, input: &str) -> Result<ToolOutput, McpError> {
        (self.entrypoint)(input.to_string()).await
    }

    /// Chat-Completions-style encoding.
    pub fn to_chat_completions_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// Response-API-style encoding.
    pub fn to_response_api_format(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    /// Claude-style encoding.
    pub fn to_claude_format(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

/// (name, description, parameters) extracted back out of a Chat-Completions
/// tool encoding.
pub fn triple_from_chat_completions(value: &Value) -> Option<(String, String, Value)> {
    let function = value.get("function")?;
    Some((
        function.get("name")?.as_str()?.to_string(),
        function.get("description")?.as_str()?.to_string(),
        function.get("parameters")?.clone(),
    ))
}

/// (name, description, parameters) from a Response-API tool encoding.
pub fn triple_from_response_api(value: &Value) -> Option<(String, String, Value)> {
    Some((
        value.get("name")?.as_str()?.to_string(),
        value.get("description")?.as_str()?.to_string(),
        value.get("parameters")?.clone(),
    ))
}

/// (name, description, parameters) from a Claude tool encoding.
pub fn triple_from_claude(value: &Value) -> Option<(String, String, Value)> {
    triple_from_response_api(value)
}

/// Result of one hook execution.
#[derive(Clone, Debug)]
pub struct HookResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl HookResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A PRE_CALL hook: runs before function execution and may deny it.
#[async_trait]
pub trait FunctionHook: Send + Sync {
    fn name(&self) -> &str;

    /// `arguments` is the raw JSON string the model produced.
    async fn execute(&self, function_name: &str, arguments: &str) -> HookResult;
}

/// Global hook adapter over the path permission manager. Denies on permission
/// violations and fails closed when arguments cannot even be parsed into the
/// shape the checks expect.
pub struct PermissionHook {
    manager: Arc<PathPermissionManager>,
}

impl PermissionHook {
    pub fn new(manager: Arc<PathPermissionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl FunctionHook for PermissionHook {
    fn name(&self) -> &str {
        "path_permission_hook"
    }

    async fn execute(&self, function_name: &str, arguments: &str) -> HookResult {
        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(v) => v,
                Err(e) => {
                    // Fail closed: unparseable arguments would dodge the path
                    // checks, since no target path can be extracted from them.
                    warn!(function = function_name, error = %e, "invalid JSON arguments in permission hook, denying");
                    return HookResult::deny(format!(
                        "Permission check failed: invalid JSON arguments ({})",
                        e
                    ));
                }
            }
        };
        let (allowed, reason) = self.manager.pre_tool_use_hook(function_name, &args);
        if allowed {
            HookResult::allow()
        } else {
            info!(function = function_name, ?reason, "permission hook blocked call");
            HookResult {
                allowed: false,
                reason,
            }
        }
    }
}

/// Registry of callable functions plus the hooks that gate them.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<Function>>,
    global_hooks: Vec<Arc<dyn FunctionHook>>,
    function_hooks: HashMap<String, Vec<Arc<dyn FunctionHook>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps every tool of a connected multi-server registry. Each entrypoint
    /// captures its external tool name by value; no late binding.
    pub fn from_mcp(mcp: &Arc<MultiServerRegistry>) -> Self {
        let mut registry = Self::new();
        for (external_name, descriptor) in mcp.tools() {
            let captured_name = external_name.clone();
            let mcp = Arc::clone(mcp);
            let entrypoint: Entrypoint = Arc::new(move |input: String| {
                let name = captured_name.clone();
                let mcp = Arc::clone(&mcp);
                Box::pin(async move {
                    let arguments: Value = serde_json::from_str(&input).map_err(|e| {
                        McpError::validation_field(
                            format!("invalid JSON arguments for tool {}: {}", name, e),
                            "arguments",
                        )
                    })?;
                    mcp.call_tool(&name, arguments).await
                })
            });
            registry.insert(Function::new(
                external_name.clone(),
                descriptor.description.clone().unwrap_or_default(),
                descriptor.input_schema.clone(),
                entrypoint,
            ));
        }
        info!(functions = registry.len(), "registered MCP tools as functions");
        registry
    }

    pub fn insert(&mut self, function: Function) {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
    }

    /// Hook applied to every function.
    pub fn add_global_hook(&mut self, hook: Arc<dyn FunctionHook>) {
        self.global_hooks.push(hook);
    }

    /// Hook applied to a single function.
    pub fn add_function_hook(&mut self, function_name: &str, hook: Arc<dyn FunctionHook>) {
        self.function_hooks
            .entry(function_name.to_string())
            .or_default()
            .push(hook);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Function>> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Calls one function: parse the JSON (typed validation failure), run
    /// every PRE_CALL hook in order (first deny short-circuits with its
    /// reason), then dispatch the entrypoint.
    pub async fn call(&self, name: &str, arguments_json: &str) -> Result<ToolOutput, McpError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| McpError::other(format!("function '{}' not available", name)))?;

        if !arguments_json.trim().is_empty() {
            let _: Value = serde_json::from_str(arguments_json).map_err(|e| {
                error!(function = name, error = %e, "invalid JSON arguments");
                McpError::validation_field(
                    format!("invalid JSON arguments for tool {}: {}", name, e),
                    "arguments",
                )
            })?;
        }

        let per_function = self.function_hooks.get(name);
        let hooks = self
            .global_hooks
            .iter()
            .chain(per_function.into_iter().flatten());
        for hook in hooks {
            let result = hook.execute(name, arguments_json).await;
            if !result.allowed {
                let reason = result
                    .reason
                    .unwrap_or_else(|| "blocked by pre-call hook".to_string());
                debug!(function = name, hook = hook.name(), reason = %reason, "call denied by hook");
                return Err(McpError::validation(reason)
                    .with_context("hook", hook.name().to_string())
                    .with_context("function", name.to_string()));
            }
        }

        function.call(arguments_json).await
    }

    /// All functions in Chat-Completions tool format.
    pub fn to_chat_completions_tools(&self) -> Vec<Value> {
        self.functions
            .values()
            .map(|f| f.to_chat_completions_format())
            .collect()
    }

    /// All functions in Response-API tool format.
    pub fn to_response_api_tools(&self) -> Vec<Value> {
        self.functions
            .values()
            .map(|f| f.to_response_api_format())
            .collect()
    }

    /// All functions in Claude tool format.
    pub fn to_claude_tools(&self) -> Vec<Value> {
        self.functions.values().map(|f| f.to_claude_format()).collect()
    }
}
