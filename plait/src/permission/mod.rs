//! Path-based permission control for tool calls.
//!
//! The manager owns every path an agent may touch (workspace, temp workspace,
//! context paths, previous-turn snapshots) with a read/write policy, and
//! pre-validates every filesystem/command tool invocation through
//! [`PathPermissionManager::pre_tool_use_hook`].
//!
//! # Main types
//!
//! - [`Permission`]: read or write.
//! - [`ManagedPath`]: one managed root (or single file) with its policy.
//! - [`PathPermissionManager`]: resolution, caching, and the pre-tool-use hook.

mod managed_path;
mod manager;

pub use managed_path::{lexical_normalize, ManagedPath, PathKind};
pub use manager::{ContextPathConfig, ContextPathInfo, PathPermissionManager};

use serde::{Deserialize, Serialize};

/// Permission level for a managed path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}
