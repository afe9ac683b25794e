//! Server configuration records. A [`ServerSpec`] is created at config load,
//! validated once by [`crate::mcp::security::validate_server_spec`], and never
//! mutated afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Security level for command/env validation; controls the executable
/// allowlist and the env-var denylist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Strict,
    Moderate,
    Permissive,
}

/// Optional per-server security policy overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOverrides {
    pub level: SecurityLevel,
    /// Explicit executable base-name allowlist (case-insensitive); replaces the
    /// level default when non-empty.
    pub allowed_executables: Vec<String>,
    pub resolve_dns: bool,
    pub allow_private_ips: bool,
    pub allow_localhost: bool,
    pub allowed_hostnames: Vec<String>,
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_sse_read_timeout_secs() -> f64 {
    300.0
}

/// Transport-specific half of a server spec; tagged by `type` as in server
/// config files (`stdio` | `streamable-http`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportSpec {
    Stdio {
        /// Command string, parsed with shell-like quoting and sanitized before
        /// spawn. May be empty when `args` already carries the full argv.
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Request/handshake deadline in seconds.
        #[serde(default = "default_timeout_secs")]
        timeout: f64,
        /// Maximum gap between events on the SSE stream, in seconds.
        #[serde(default = "default_sse_read_timeout_secs")]
        sse_read_timeout: f64,
    },
}

/// Immutable configuration record for one MCP server.
///
/// **Interaction**: Loaded from config (see the `config` crate), validated by
/// the security module, consumed by [`crate::mcp::session::McpSession`] and
/// [`crate::mcp::registry::MultiServerRegistry`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Unique name; alphanumeric/underscore/hyphen, at most 100 chars.
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
    /// When non-empty, only these (server-local) tool names are kept.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools excluded even when allowed_tools lists them.
    #[serde(default)]
    pub exclude_tools: Vec<String>,
    #[serde(default)]
    pub security: SecurityOverrides,
}

impl ServerSpec {
    /// Minimal stdio spec from a pre-split argv; mainly for tests and the
    /// workspace supervisor's generated servers.
    pub fn stdio(name: impl Into<String>, argv: Vec<String>) -> Self {
        let mut parts = argv;
        let command = if parts.is_empty() {
            None
        } else {
            Some(parts.remove(0))
        };
        Self {
            name: name.into(),
            transport: TransportSpec::Stdio {
                command,
                args: parts,
                env: HashMap::new(),
                cwd: None,
            },
            allowed_tools: Vec::new(),
            exclude_tools: Vec::new(),
            security: SecurityOverrides::default(),
        }
    }

    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportSpec::StreamableHttp {
                url: url.into(),
                headers: HashMap::new(),
                timeout: default_timeout_secs(),
                sse_read_timeout: default_sse_read_timeout_secs(),
            },
            allowed_tools: Vec::new(),
            exclude_tools: Vec::new(),
            security: SecurityOverrides::default(),
        }
    }

    pub fn transport_kind(&self) -> &'static str {
        match self.transport {
            TransportSpec::Stdio { .. } => "stdio",
            TransportSpec::StreamableHttp { .. } => "streamable-http",
        }
    }

    /// Request deadline for this server's operations.
    pub fn timeout(&self) -> Duration {
        match &self.transport {
            TransportSpec::Stdio { .. } => Duration::from_secs_f64(default_timeout_secs()),
            TransportSpec::StreamableHttp { timeout, .. } => Duration::from_secs_f64(*timeout),
        }
    }
}
