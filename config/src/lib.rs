//! Load configuration from XDG `config.toml` and project `.env`, then apply to
//! the process environment with priority: **existing env > .env > XDG**.
//!
//! Also discovers MCP server-spec files (`plait.toml` / `.plait/servers.toml`)
//! and hands their `[[mcp_servers]]` entries to the core crate as raw JSON for
//! validation there. Provider API-key variables are only ever read from the
//! environment by name; nothing here forwards them into spawned servers.

mod dotenv;
mod servers;
mod xdg_toml;

use std::path::Path;
use thiserror::Error;

pub use servers::{discover_server_specs, load_server_specs};

/// Env-mutating tests share the process environment; they serialize on this.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config path: {0}")]
    XdgPath(String),
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
    #[error("read server specs {path}: {source}")]
    ServersRead {
        path: String,
        source: std::io::Error,
    },
    #[error("parse server specs {path}: {source}")]
    ServersParse {
        path: String,
        source: toml::de::Error,
    },
}

/// Loads config from XDG `config.toml` and optional project `.env`, then sets
/// environment variables only for keys that are **not** already set, so the
/// existing environment always wins.
///
/// Precedence for a key missing from the process environment:
/// 1. value from the project `.env` (current directory, or `override_dir`);
/// 2. value from `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]` table.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<&String> = xdg_map.keys().collect();
    keys.extend(dotenv_map.keys());

    for key in keys {
        if std::env::var(key).is_ok() {
            continue;
        }
        if let Some(value) = dotenv_map.get(key).or_else(|| xdg_map.get(key)) {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins_over_dotenv() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "PLAIT_TEST_EXISTING=from_dotenv\n").unwrap();
        env::set_var("PLAIT_TEST_EXISTING", "from_env");
        let _ = load_and_apply("plait-test-none", Some(dir.path()));
        assert_eq!(env::var("PLAIT_TEST_EXISTING").as_deref(), Ok("from_env"));
        env::remove_var("PLAIT_TEST_EXISTING");
    }

    #[test]
    fn dotenv_beats_xdg_when_both_present() {
        let _guard = crate::TEST_ENV_LOCK.lock().unwrap();
        let xdg = tempfile::tempdir().unwrap();
        let app = xdg.path().join("plait");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join("config.toml"),
            "[env]\nPLAIT_TEST_PRIORITY = \"from_xdg\"\n",
        )
        .unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(".env"), "PLAIT_TEST_PRIORITY=from_dotenv\n").unwrap();

        let prev = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg.path());
        env::remove_var("PLAIT_TEST_PRIORITY");
        let _ = load_and_apply("plait", Some(project.path()));
        let value = env::var("PLAIT_TEST_PRIORITY");
        env::remove_var("PLAIT_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev);

        assert_eq!(value.as_deref(), Ok("from_dotenv"));
    }

    #[test]
    fn missing_everything_is_fine() {
        assert!(load_and_apply("plait-test-nonexistent-app", None).is_ok());
    }
}
