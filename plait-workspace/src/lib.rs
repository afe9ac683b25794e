//! Workspace and container supervision for Plait agents.
//!
//! Creates per-agent workspaces (cleared at start-of-turn, snapshotted on
//! save, restored into temp workspaces for inter-agent context sharing),
//! seeds the path permission manager, generates the auto-injected MCP server
//! specs (`filesystem`, `workspace_tools`, `command_line`), and optionally
//! isolates everything in a Docker container.
//!
//! # Main types
//!
//! - [`FilesystemManager`]: workspace lifecycle + permission seeding.
//! - [`BackendConfigBuilder`]: appends the generated server specs to a
//!   backend's list (with the docker-exec rewrite when MCP runs inside the
//!   container).
//! - `DockerManager` (feature `docker`): container per agent with bind mounts
//!   and resource caps.

mod inject;
mod manager;

#[cfg(feature = "docker")]
mod docker;

pub use inject::{BackendConfigBuilder, CommandLineOptions, InjectOptions};
pub use manager::{FilesystemManager, WorkspaceError};

#[cfg(feature = "docker")]
pub use docker::{
    early_container_name, DockerError, DockerManager, DockerManagerConfig, DockerResources,
};
