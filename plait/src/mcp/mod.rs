//! MCP integration: wire types, transports, sessions, the multi-server
//! registry, per-server circuit breaking and config security validation.
//!
//! # Main types
//!
//! - [`ServerSpec`]: immutable per-server configuration (stdio / streamable-http).
//! - [`McpSession`]: one server's connection state machine and tool calls.
//! - [`MultiServerRegistry`]: many sessions behind `mcp__<server>__<tool>` names.
//! - [`CircuitBreaker`]: per-server failure accounting with exponential backoff.
//! - [`security`]: pure validators every server config flows through.

pub mod breaker;
pub mod jsonrpc;
pub mod registry;
pub mod security;
pub mod session;
pub mod spec;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use registry::MultiServerRegistry;
pub use session::{
    McpSession, PromptDescriptor, ResourceDescriptor, SessionState, ToolDescriptor, ToolOutput,
};
pub use spec::{SecurityLevel, SecurityOverrides, ServerSpec, TransportSpec};
pub use transport::{HttpTransport, StdioTransport, Transport};
