//! MCP error taxonomy: one tagged union with per-kind payloads and a free-form
//! context map, plus the transient/auth classification the retry logic keys on.
//!
//! **Interaction**: Transports and sessions construct these; the backend loop
//! never propagates them to its caller; every failure becomes a tool-result
//! payload or a status chunk the model/orchestrator can observe.

use std::collections::BTreeMap;
use std::time::Duration;

/// Context map attached to errors. Sorted keys keep Display output stable.
pub type ErrorContext = BTreeMap<String, String>;

/// Error kinds for MCP operations.
///
/// Connection and timeout errors are transient (retried, counted by the
/// circuit breaker). Validation and config errors are surfaced immediately.
/// Auth and resource errors are never retried. Server errors are retried only
/// when the message matches the transient patterns.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("connection: {message}{}", format_context(.context))]
    Connection {
        message: String,
        context: ErrorContext,
    },
    #[error("timeout after {timeout:?} in {operation}{}", format_context(.context))]
    Timeout {
        operation: String,
        timeout: Duration,
        context: ErrorContext,
    },
    #[error("server: {message}{}", format_context(.context))]
    Server {
        message: String,
        code: Option<i64>,
        context: ErrorContext,
    },
    #[error("validation: {message}{}", format_context(.context))]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },
    #[error("authentication: {message}{}", format_context(.context))]
    Auth {
        message: String,
        context: ErrorContext,
    },
    #[error("resource: {message}{}", format_context(.context))]
    Resource {
        message: String,
        context: ErrorContext,
    },
    #[error("configuration: {message}{}", format_context(.context))]
    Config {
        message: String,
        context: ErrorContext,
    },
    #[error("{message}{}", format_context(.context))]
    Other {
        message: String,
        context: ErrorContext,
    },
}

fn format_context(context: &ErrorContext) -> String {
    if context.is_empty() {
        return String::new();
    }
    let items: Vec<String> = context.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" | {}", items.join(", "))
}

/// Server-error message fragments treated as transient (retryable).
const TRANSIENT_PATTERNS: [&str; 10] = [
    "timeout",
    "connection",
    "network",
    "temporary",
    "unavailable",
    "503",
    "502",
    "504",
    "500",
    "retry",
];

impl McpError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
            context: ErrorContext::new(),
        }
    }

    pub fn server(message: impl Into<String>, code: Option<i64>) -> Self {
        Self::Server {
            message: message.into(),
            code,
            context: ErrorContext::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
            context: ErrorContext::new(),
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
            context: ErrorContext::new(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Adds one context entry, builder style.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_mut().insert(key.into(), value.into());
        self
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Connection { context, .. }
            | Self::Timeout { context, .. }
            | Self::Server { context, .. }
            | Self::Validation { context, .. }
            | Self::Auth { context, .. }
            | Self::Resource { context, .. }
            | Self::Config { context, .. }
            | Self::Other { context, .. } => context,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Connection { context, .. }
            | Self::Timeout { context, .. }
            | Self::Server { context, .. }
            | Self::Validation { context, .. }
            | Self::Auth { context, .. }
            | Self::Resource { context, .. }
            | Self::Config { context, .. }
            | Self::Other { context, .. } => context,
        }
    }

    /// Whether the retry loop should attempt this error again.
    ///
    /// Connection, timeout and resource errors are transient; server errors
    /// only when the message matches a transient pattern.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } | Self::Resource { .. } => true,
            Self::Server { message, .. } => {
                let lower = message.to_lowercase();
                TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
            }
            _ => false,
        }
    }

    /// Auth/resource errors are recorded by the breaker and never retried.
    pub fn is_auth_or_resource(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::Resource { .. })
    }

    /// Short category slug for logging and error payloads.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Server { .. } => "server",
            Self::Validation { .. } => "validation",
            Self::Auth { .. } => "auth",
            Self::Resource { .. } => "resource",
            Self::Config { .. } => "config",
            Self::Other { .. } => "general",
        }
    }

    /// Concise user-facing phrase for status chunks.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "MCP connection failed",
            Self::Timeout { .. } => "MCP session timeout",
            Self::Server { .. } => "MCP server error",
            Self::Validation { .. } => "MCP validation failed",
            Self::Auth { .. } => "MCP authentication failed",
            Self::Resource { .. } => "MCP resource unavailable",
            Self::Config { .. } => "MCP configuration invalid",
            Self::Other { .. } => "MCP error",
        }
    }
}

/// Retry delay `base * 2^attempt` plus jitter in [10%, 30%] of the base
/// delay. Jitter derives from the clock's sub-second bits; no RNG crate is
/// warranted for one call site.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    let backoff = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let unit = (nanos % 1000) as f64 / 1000.0;
    let jitter = (0.1 + 0.2 * unit) * base.as_secs_f64();
    Duration::from_secs_f64(backoff + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_kind_and_message() {
        assert!(McpError::connection("refused").is_transient());
        assert!(McpError::timeout("call_tool(x)", Duration::from_secs(1)).is_transient());
        assert!(McpError::server("503 Service Unavailable", None).is_transient());
        assert!(McpError::server("Temporary failure", None).is_transient());
        assert!(!McpError::server("invalid params", Some(-32602)).is_transient());
        assert!(!McpError::validation("bad args").is_transient());
        assert!(!McpError::Auth {
            message: "denied".into(),
            context: ErrorContext::new()
        }
        .is_transient());
    }

    #[test]
    fn auth_and_resource_are_not_retried() {
        let auth = McpError::Auth {
            message: "bad key".into(),
            context: ErrorContext::new(),
        };
        let res = McpError::Resource {
            message: "quota".into(),
            context: ErrorContext::new(),
        };
        assert!(auth.is_auth_or_resource());
        assert!(res.is_auth_or_resource());
        assert!(!McpError::connection("x").is_auth_or_resource());
    }

    #[test]
    fn display_includes_context_entries() {
        let err = McpError::connection("refused")
            .with_context("server_name", "fs")
            .with_context("transport", "stdio");
        let s = err.to_string();
        assert!(s.contains("refused"));
        assert!(s.contains("server_name=fs"));
        assert!(s.contains("transport=stdio"));
    }

    #[test]
    fn retry_delay_grows_exponentially_with_jitter_pinned_to_base() {
        let base = Duration::from_millis(500);
        let base_secs = base.as_secs_f64();
        for attempt in 0..4 {
            let d = retry_delay(attempt, base).as_secs_f64();
            let backoff = base_secs * 2f64.powi(attempt as i32);
            // Jitter stays within [10%, 30%] of the fixed base, regardless of
            // the attempt number.
            assert!(
                d >= backoff + 0.1 * base_secs - 1e-9,
                "attempt {}: {} too small",
                attempt,
                d
            );
            assert!(
                d <= backoff + 0.3 * base_secs + 1e-9,
                "attempt {}: {} too large",
                attempt,
                d
            );
        }
    }
}
