//! MCP server-spec file discovery and parsing.
//!
//! Server lists live in `plait.toml` (a `[[mcp_servers]]` array of tables) or
//! `.plait/servers.toml`, found by walking upward from a start directory.
//! Entries are returned as raw JSON values; the core crate owns validation
//! (names, transports, security policy), so this stays a pure file concern.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::LoadError;

/// File names probed in each ancestor directory, in order.
const SPEC_FILES: [&str; 2] = ["plait.toml", ".plait/servers.toml"];

#[derive(serde::Deserialize, Default)]
struct SpecFile {
    #[serde(default)]
    mcp_servers: Vec<toml::Value>,
}

/// Finds the nearest server-spec file at or above `start_dir`.
pub fn discover_server_specs(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(start_dir);
    while let Some(current) = dir {
        for name in SPEC_FILES {
            let candidate = current.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent();
    }
    None
}

/// Parses the `[[mcp_servers]]` entries of one spec file into JSON values. A
/// server entry without a `name` gets `server_<index>`, so later validation
/// can still point at it.
pub fn load_server_specs(path: &Path) -> Result<Vec<Value>, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::ServersRead {
        path: path.display().to_string(),
        source,
    })?;
    let file: SpecFile = toml::from_str(&content).map_err(|source| LoadError::ServersParse {
        path: path.display().to_string(),
        source,
    })?;

    let mut specs = Vec::with_capacity(file.mcp_servers.len());
    for (index, entry) in file.mcp_servers.into_iter().enumerate() {
        let mut value =
            serde_json::to_value(entry).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Value::Object(map) = &mut value {
            map.entry("name")
                .or_insert_with(|| Value::String(format!("server_{}", index)));
        }
        specs.push(value);
    }
    Ok(specs)
}
