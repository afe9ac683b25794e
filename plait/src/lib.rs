//! # Plait
//!
//! Multi-agent MCP integration core: persistent sessions to many tool servers
//! over heterogeneous transports, a unified function-call surface for model
//! backends, per-server circuit breaking, path-based permissions, and the
//! recursive stream-and-execute loop that interleaves model output with tool
//! calls until the model yields a final answer.
//!
//! ## Main modules
//!
//! - [`mcp`]: [`ServerSpec`], transports (stdio / streamable-http),
//!   [`McpSession`], [`MultiServerRegistry`], [`CircuitBreaker`], security
//!   validators.
//! - [`permission`]: [`PathPermissionManager`] and the pre-tool-use hook.
//! - [`function`]: [`Function`] wrappers, [`FunctionRegistry`], PRE_CALL hooks.
//! - [`model`]: [`ModelClient`] trait, [`ModelEvent`] streams, [`MockModel`].
//! - [`backend`]: [`BackendRunner`], the streaming tool loop.
//! - [`message`]: conversation [`Message`]s and history trimming.
//! - [`error`]: the [`McpError`] taxonomy and retry classification.
//!
//! Up-call chunks (`content`, `tool_calls`, `mcp_status`, `done`, ...) live in
//! the sibling `stream-chunk` crate.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use plait::{BackendRunner, Message, MockModel, RunnerOptions, ServerSpec};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let model = Arc::new(MockModel::new());
//! model.push_text_turn("hello");
//!
//! let specs = vec![ServerSpec::stdio(
//!     "fs",
//!     vec!["npx".into(), "-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/work".into()],
//! )];
//! let runner = Arc::new(BackendRunner::new(model, specs, RunnerOptions::default()));
//!
//! let mut chunks = runner.stream(vec![Message::user("read /work/hello.txt")]);
//! while let Some(chunk) = chunks.next().await {
//!     println!("{:?}", chunk);
//! }
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod function;
pub mod mcp;
pub mod message;
pub mod model;
pub mod permission;

pub use backend::{BackendRunner, RunnerOptions};
pub use error::{retry_delay, ErrorContext, McpError};
pub use function::{
    triple_from_chat_completions, triple_from_claude, triple_from_response_api, Function,
    FunctionHook, FunctionRegistry, HookResult, PermissionHook,
};
pub use mcp::{
    CircuitBreaker, CircuitBreakerConfig, McpSession, MultiServerRegistry, SecurityLevel,
    ServerSpec, SessionState, ToolDescriptor, ToolOutput, TransportSpec,
};
pub use message::{trim_history, Message, DEFAULT_MAX_HISTORY};
pub use model::{ApiParams, MockModel, ModelClient, ModelEvent, ModelEventStream, ToolCallAccumulator};
pub use permission::{
    ContextPathConfig, ContextPathInfo, ManagedPath, PathKind, PathPermissionManager, Permission,
};

// Re-export the chunk types alongside the loop that produces them.
pub use stream_chunk::{McpStatusKind, StreamChunk, ToolCallPayload};

/// When running `cargo test -p plait`, initializes tracing from `RUST_LOG` so
/// unit tests can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
