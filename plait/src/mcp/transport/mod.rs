//! Transport clients: one duplex JSON-RPC channel per server, stdio subprocess
//! or streamable HTTP. Opened and closed by the owning session's supervisor
//! task only; everything else goes through `request`/`notify`.

mod http;
mod stdio;

use std::time::Duration;

use serde_json::Value;

use crate::error::McpError;
use crate::mcp::jsonrpc::ResultMessage;
use crate::mcp::security;
use crate::mcp::spec::{ServerSpec, TransportSpec};

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// A live channel to one MCP server.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Opens the transport described by the spec. For stdio this spawns the
    /// server process with the sanitized argv; for streamable HTTP it builds
    /// the client with the spec's deadlines.
    pub fn open(spec: &ServerSpec, stderr_verbose: bool) -> Result<Self, McpError> {
        match &spec.transport {
            TransportSpec::Stdio { env, cwd, .. } => {
                let argv = security::stdio_argv(spec)?;
                let transport =
                    StdioTransport::spawn(&argv, env, cwd.as_deref(), stderr_verbose)?;
                Ok(Self::Stdio(transport))
            }
            TransportSpec::StreamableHttp {
                url,
                headers,
                timeout,
                sse_read_timeout,
            } => {
                let transport = HttpTransport::new(
                    url.clone(),
                    headers.iter().map(|(k, v)| (k.clone(), v.clone())),
                    Duration::from_secs_f64(*timeout),
                    Duration::from_secs_f64(*sse_read_timeout),
                )?;
                Ok(Self::Http(transport))
            }
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<ResultMessage, McpError> {
        match self {
            Self::Stdio(t) => t.request(method, params, deadline).await,
            Self::Http(t) => t.request(method, params, deadline).await,
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        match self {
            Self::Stdio(t) => t.notify(method, params),
            Self::Http(t) => t.notify(method, params).await,
        }
    }

    /// Idempotent release of all transport resources.
    pub async fn close(&self) {
        match self {
            Self::Stdio(t) => t.close().await,
            Self::Http(_) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Stdio(t) => t.is_closed(),
            Self::Http(_) => false,
        }
    }
}
