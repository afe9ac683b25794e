//! Backend streaming loop: ask the model, execute the tool calls it streams,
//! feed results back, repeat until it answers in plain text.
//!
//! # Main types
//!
//! - [`BackendRunner`]: drives the recursive stream-and-execute loop for one
//!   backend, owning its MCP setup, circuit breaker and function registry.
//! - [`RunnerOptions`]: iteration/history/retry bounds and provider tools.
//!
//! The loop never propagates a tool failure to its caller: every failure
//! becomes a tool-result payload the model can observe, or a status chunk for
//! the orchestrator. Setup failures fall through to a no-MCP mode where the
//! backend streams without MCP tools.

mod runner;

pub use runner::{BackendRunner, RunnerOptions};
