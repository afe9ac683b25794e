//! The permission manager and its pre-tool-use hook.
//!
//! Resolution order for a queried path (first match wins):
//! 1. matches an exclusion pattern outside any workspace → read-only;
//! 2. inside a protected subpath → read-only;
//! 3. a file-specific context path (exact match) → that file's permission;
//! 4. the deepest containing directory path → that path's permission;
//! 5. inside a file-context parent with no specific match → no permission
//!    (the hook denies sibling access);
//! 6. unknown → no permission (callers treat unknown as allowed because the
//!    filesystem MCP server already restricts the universe).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use glob::Pattern;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::managed_path::{lexical_normalize, ManagedPath, PathKind};
use super::Permission;

/// Name fragments (any path component) always excluded from write access
/// outside workspaces.
pub const DEFAULT_EXCLUDED_PATTERNS: [&str; 12] = [
    ".plait",
    ".env",
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".DS_Store",
    "plait_logs",
];

static WRITE_TOOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(write|edit|create|move|delete|remove|copy)").unwrap());

/// Command substrings that are denied outright.
const DANGEROUS_COMMAND_PATTERNS: [&str; 11] = [
    "rm ", "rm -", "rmdir", "del ", "sudo ", "su ", "chmod ", "chown ", "format ", "fdisk", "mkfs",
];

/// Command substrings that mutate files; the target path gets a write check.
const MUTATING_COMMAND_PATTERNS: [&str; 11] = [
    ">>", ">", "mv ", "move ", "cp ", "copy ", "touch ", "mkdir ", "echo ", "sed -i", "perl -i",
];

/// Argument keys that may carry the target path of a tool call. Source-side
/// keys are deliberately absent: sources are read, never written.
const PATH_ARGUMENT_KEYS: [&str; 9] = [
    "file_path",
    "path",
    "filename",
    "file",
    "notebook_path",
    "target",
    "destination",
    "destination_path",
    "destination_base_path",
];

/// One context path entry as written in configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextPathConfig {
    pub path: String,
    #[serde(default = "default_read")]
    pub permission: Permission,
    #[serde(default)]
    pub protected_paths: Vec<String>,
}

fn default_read() -> Permission {
    Permission::Read
}

/// Context path summary for system prompts.
#[derive(Clone, Debug, Serialize)]
pub struct ContextPathInfo {
    pub path: String,
    pub permission: Permission,
    pub will_be_writable: bool,
}

struct Inner {
    managed: Vec<ManagedPath>,
    context_write_access_enabled: bool,
}

/// Manages all filesystem paths and implements the pre-tool-use hook that
/// intercepts and validates tool calls against those permissions.
pub struct PathPermissionManager {
    inner: Mutex<Inner>,
    /// Memoized resolutions; invalidated on every add and policy toggle.
    cache: Mutex<HashMap<PathBuf, Option<Permission>>>,
}

impl PathPermissionManager {
    /// `context_write_access_enabled` gates write permission on context paths
    /// declared writable; workspace paths are writable regardless.
    pub fn new(context_write_access_enabled: bool) -> Self {
        info!(context_write_access_enabled, "path permission manager initialized");
        Self {
            inner: Mutex::new(Inner {
                managed: Vec::new(),
                context_write_access_enabled,
            }),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn clear_cache(&self) {
        self.cache.lock().expect("cache lock poisoned").clear();
    }

    /// Adds one managed path (workspace, temp workspace, previous turn, ...).
    pub fn add_path(&self, path: &Path, permission: Permission, kind: PathKind) {
        if kind == PathKind::Context && !path.exists() {
            warn!(path = %path.display(), "context path does not exist");
            return;
        }
        let mut inner = self.inner.lock().expect("inner lock poisoned");
        inner
            .managed
            .push(ManagedPath::new(path.to_path_buf(), permission, kind));
        drop(inner);
        self.clear_cache();
        info!(path = %path.display(), kind = kind.as_str(), permission = permission.as_str(), "added managed path");
    }

    /// Adds context paths from configuration. Files are tracked individually;
    /// their parent directory is added as a file-context parent so the
    /// filesystem server can reach the file without exposing its siblings.
    /// Protected paths resolve relative to the context entry and must stay
    /// within it.
    pub fn add_context_paths(&self, configs: &[ContextPathConfig]) {
        for config in configs {
            if config.path.is_empty() {
                continue;
            }
            let path = PathBuf::from(&config.path);
            if !path.exists() {
                warn!(path = %path.display(), "context path does not exist");
                continue;
            }
            let is_file = path.is_file();
            let normalized = lexical_normalize(&path);

            let base_dir = if is_file {
                normalized.parent().map(Path::to_path_buf)
            } else {
                Some(normalized.clone())
            };
            let mut protected_paths = Vec::new();
            for protected in &config.protected_paths {
                let p = PathBuf::from(protected);
                let resolved = if p.is_absolute() {
                    lexical_normalize(&p)
                } else if let Some(base) = &base_dir {
                    lexical_normalize(&base.join(&p))
                } else {
                    continue;
                };
                let within = base_dir
                    .as_ref()
                    .map(|base| resolved.starts_with(base))
                    .unwrap_or(false);
                if within {
                    info!(path = %resolved.display(), "added protected path");
                    protected_paths.push(resolved);
                } else {
                    warn!(
                        protected = %resolved.display(),
                        context = %normalized.display(),
                        "protected path is not within context path, skipping"
                    );
                }
            }

            let mut inner = self.inner.lock().expect("inner lock poisoned");

            if is_file {
                if let Some(parent) = normalized.parent() {
                    let parent = parent.to_path_buf();
                    let already = inner.managed.iter().any(|mp| {
                        mp.path == parent && mp.kind == PathKind::FileContextParent
                    });
                    if !already {
                        inner.managed.push(ManagedPath::new(
                            parent,
                            Permission::Read,
                            PathKind::FileContextParent,
                        ));
                    }
                }
            }

            let will_be_writable = config.permission == Permission::Write;
            // Only the final agent (write access enabled) gets write on paths
            // declared writable; coordination agents stay read-only.
            let actual = if inner.context_write_access_enabled && will_be_writable {
                Permission::Write
            } else if will_be_writable {
                Permission::Read
            } else {
                config.permission
            };

            let mut managed = ManagedPath::new(normalized.clone(), actual, PathKind::Context);
            managed.will_be_writable = will_be_writable;
            managed.is_file = is_file;
            managed.protected_paths = protected_paths;
            inner.managed.push(managed);
            drop(inner);
            self.clear_cache();
            info!(
                path = %normalized.display(),
                permission = actual.as_str(),
                will_be_writable,
                is_file,
                "added context path"
            );
        }
    }

    /// Previous-turn workspaces are always read-only.
    pub fn add_previous_turn_paths(&self, paths: &[PathBuf]) {
        let mut inner = self.inner.lock().expect("inner lock poisoned");
        for path in paths {
            inner.managed.push(ManagedPath::new(
                path.clone(),
                Permission::Read,
                PathKind::PreviousTurn,
            ));
            info!(path = %path.display(), "added previous turn path (read-only)");
        }
        drop(inner);
        self.clear_cache();
    }

    /// Recomputes every context path's effective permission from its
    /// originally-declared `will_be_writable`.
    pub fn set_context_write_access_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().expect("inner lock poisoned");
        if inner.context_write_access_enabled == enabled {
            return;
        }
        info!(enabled, "updating context write access");
        inner.context_write_access_enabled = enabled;
        for mp in &mut inner.managed {
            if mp.kind == PathKind::Context && mp.will_be_writable {
                mp.permission = if enabled {
                    Permission::Write
                } else {
                    Permission::Read
                };
            }
        }
        drop(inner);
        self.clear_cache();
    }

    pub fn context_write_access_enabled(&self) -> bool {
        self.inner
            .lock()
            .expect("inner lock poisoned")
            .context_write_access_enabled
    }

    /// Context paths in configuration form for system prompts.
    pub fn context_paths(&self) -> Vec<ContextPathInfo> {
        let inner = self.inner.lock().expect("inner lock poisoned");
        inner
            .managed
            .iter()
            .filter(|mp| mp.kind == PathKind::Context)
            .map(|mp| ContextPathInfo {
                path: mp.path.display().to_string(),
                permission: mp.permission,
                will_be_writable: mp.will_be_writable,
            })
            .collect()
    }

    /// Whether the path hits an exclusion pattern. Workspaces override
    /// exclusions: `.env` inside a workspace is fair game, outside it never is.
    fn is_excluded_path(inner: &Inner, path: &Path) -> bool {
        for mp in &inner.managed {
            if mp.kind == PathKind::Workspace && mp.contains(path) {
                return false;
            }
        }
        path.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| DEFAULT_EXCLUDED_PATTERNS.contains(&s))
                .unwrap_or(false)
        })
    }

    /// Resolves the permission for a path, if any managed path covers it.
    pub fn get_permission(&self, path: &Path) -> Option<Permission> {
        let resolved = lexical_normalize(path);

        if let Some(cached) = self
            .cache
            .lock()
            .expect("cache lock poisoned")
            .get(&resolved)
        {
            return *cached;
        }

        let inner = self.inner.lock().expect("inner lock poisoned");
        let result = Self::resolve_permission(&inner, &resolved);
        drop(inner);

        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(resolved, result);
        result
    }

    fn resolve_permission(inner: &Inner, resolved: &Path) -> Option<Permission> {
        if Self::is_excluded_path(inner, resolved) {
            debug!(path = %resolved.display(), "excluded pattern, forcing read-only");
            return Some(Permission::Read);
        }

        // Protected subpaths beat everything below.
        for mp in &inner.managed {
            if mp.contains(resolved) && mp.is_protected(resolved) {
                debug!(path = %resolved.display(), "protected path, forcing read-only");
                return Some(Permission::Read);
            }
        }

        // File-specific context paths win over any enclosing directory.
        for mp in inner.managed.iter().filter(|mp| mp.is_file) {
            if mp.contains(resolved) {
                return Some(mp.permission);
            }
        }

        // Deepest containing directory wins; file-context parents are only for
        // MCP path lists, never grant permission.
        let mut dirs: Vec<&ManagedPath> = inner
            .managed
            .iter()
            .filter(|mp| !mp.is_file && mp.kind != PathKind::FileContextParent)
            .collect();
        dirs.sort_by_key(|mp| std::cmp::Reverse(mp.depth()));
        for mp in dirs {
            if mp.contains(resolved) {
                return Some(mp.permission);
            }
        }

        None
    }

    /// Pre-tool-use hook: decides whether a tool call may proceed.
    ///
    /// Write-like tools get their target path checked; command tools get
    /// scanned for dangerous and mutating patterns; everything else is
    /// permitted except sibling access inside file-context parent directories.
    pub fn pre_tool_use_hook(&self, tool_name: &str, tool_args: &Value) -> (bool, Option<String>) {
        if Self::is_write_tool(tool_name) {
            return self.validate_write_tool(tool_name, tool_args);
        }

        let command_tools = ["Bash", "bash", "shell", "exec"];
        if command_tools.contains(&tool_name) || tool_name.ends_with("execute_command") {
            return self.validate_command_tool(tool_args);
        }

        self.validate_file_context_access(tool_name, tool_args)
    }

    fn is_write_tool(tool_name: &str) -> bool {
        WRITE_TOOL_RE.is_match(tool_name)
    }

    fn extract_file_path(tool_args: &Value) -> Option<String> {
        let obj = tool_args.as_object()?;
        for key in PATH_ARGUMENT_KEYS {
            if let Some(v) = obj.get(key).and_then(Value::as_str) {
                return Some(v.to_string());
            }
        }
        None
    }

    /// First workspace path; relative tool paths resolve against it, the same
    /// way the filesystem server itself resolves them.
    fn first_workspace(&self) -> Option<PathBuf> {
        let inner = self.inner.lock().expect("inner lock poisoned");
        inner
            .managed
            .iter()
            .find(|mp| mp.kind == PathKind::Workspace)
            .map(|mp| mp.path.clone())
    }

    fn resolve_against_workspace(&self, path_str: &str) -> PathBuf {
        let path = PathBuf::from(path_str);
        if path.is_absolute() {
            return path;
        }
        match self.first_workspace() {
            Some(workspace) => {
                let resolved = workspace.join(&path);
                debug!(from = path_str, to = %resolved.display(), "resolved relative path against workspace");
                resolved
            }
            None => path,
        }
    }

    fn deny_if_sibling_of_file_context(&self, path: &Path) -> Option<String> {
        let inner = self.inner.lock().expect("inner lock poisoned");
        let in_parent = inner
            .managed
            .iter()
            .filter(|mp| mp.kind == PathKind::FileContextParent)
            .any(|mp| mp.contains(path));
        if in_parent {
            Some(format!(
                "Access denied: '{}' is not an explicitly allowed file in this directory",
                path.display()
            ))
        } else {
            None
        }
    }

    fn validate_write_tool(&self, tool_name: &str, tool_args: &Value) -> (bool, Option<String>) {
        if tool_name.ends_with("copy_files_batch") {
            return self.validate_copy_files_batch(tool_args);
        }

        let Some(file_path) = Self::extract_file_path(tool_args) else {
            // No recognizable path argument: likely workspace-relative output,
            // nothing to check here.
            return (true, None);
        };

        let path = lexical_normalize(&self.resolve_against_workspace(&file_path));
        let permission = self.get_permission(&path);
        debug!(tool = tool_name, path = %path.display(), ?permission, "validating write tool");

        match permission {
            None => match self.deny_if_sibling_of_file_context(&path) {
                Some(reason) => (false, Some(reason)),
                None => (true, None),
            },
            Some(Permission::Write) => (true, None),
            Some(Permission::Read) => (
                false,
                Some(format!(
                    "No write permission for '{}' (read-only context path)",
                    path.display()
                )),
            ),
        }
    }

    /// Enumerates every destination the batch copy would write and checks
    /// each one.
    fn validate_copy_files_batch(&self, tool_args: &Value) -> (bool, Option<String>) {
        let Some(source_base) = tool_args.get("source_base_path").and_then(Value::as_str) else {
            return (false, Some("copy_files_batch requires source_base_path".into()));
        };
        let destination_base = tool_args
            .get("destination_base_path")
            .and_then(Value::as_str)
            .unwrap_or("");
        let include = string_list(tool_args.get("include_patterns"));
        let exclude = string_list(tool_args.get("exclude_patterns"));

        let destination_base = self.resolve_against_workspace(destination_base);
        let pairs = match copy_destinations(
            Path::new(source_base),
            &destination_base,
            &include,
            &exclude,
        ) {
            Ok(pairs) => pairs,
            Err(e) => return (false, Some(format!("copy_files_batch validation failed: {}", e))),
        };

        let mut blocked: Vec<String> = Vec::new();
        for dest in pairs {
            if self.get_permission(&dest) == Some(Permission::Read) {
                blocked.push(dest.display().to_string());
            }
        }
        if !blocked.is_empty() {
            let mut examples = blocked[..blocked.len().min(3)].join(", ");
            if blocked.len() > 3 {
                examples.push_str(&format!(" (and {} more)", blocked.len() - 3));
            }
            return (
                false,
                Some(format!("No write permission for destination paths: {}", examples)),
            );
        }
        (true, None)
    }

    fn validate_command_tool(&self, tool_args: &Value) -> (bool, Option<String>) {
        let command = tool_args
            .get("command")
            .and_then(Value::as_str)
            .or_else(|| tool_args.get("cmd").and_then(Value::as_str))
            .unwrap_or("");

        for pattern in MUTATING_COMMAND_PATTERNS {
            if command.contains(pattern) {
                if let Some(target) = extract_file_from_command(command, pattern) {
                    let path = lexical_normalize(&self.resolve_against_workspace(&target));
                    if self.get_permission(&path) == Some(Permission::Read) {
                        return (
                            false,
                            Some(format!(
                                "Command would modify read-only context path: {}",
                                path.display()
                            )),
                        );
                    }
                }
            }
        }

        let lowered = command.to_lowercase();
        for pattern in DANGEROUS_COMMAND_PATTERNS {
            if lowered.contains(pattern) {
                return (
                    false,
                    Some(format!("Dangerous command pattern '{}' is not allowed", pattern.trim_end())),
                );
            }
        }

        (true, None)
    }

    /// Read-like tools are permitted except when they reach for siblings of a
    /// file context path.
    fn validate_file_context_access(&self, tool_name: &str, tool_args: &Value) -> (bool, Option<String>) {
        let Some(file_path) = Self::extract_file_path(tool_args) else {
            return (true, None);
        };
        let path = lexical_normalize(&self.resolve_against_workspace(&file_path));
        let permission = self.get_permission(&path);
        debug!(tool = tool_name, path = %path.display(), ?permission, "validating file context access");

        if permission.is_none() {
            if let Some(reason) = self.deny_if_sibling_of_file_context(&path) {
                return (false, Some(reason));
            }
        }
        (true, None)
    }

    /// All managed directories for the filesystem MCP server arguments;
    /// workspace paths come first. File entries are excluded (the server takes
    /// directories only; their parents are already tracked).
    pub fn mcp_filesystem_paths(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("inner lock poisoned");
        let workspaces = inner
            .managed
            .iter()
            .filter(|mp| mp.kind == PathKind::Workspace)
            .map(|mp| mp.path.display().to_string());
        let others = inner
            .managed
            .iter()
            .filter(|mp| mp.kind != PathKind::Workspace && !mp.is_file)
            .map(|mp| mp.path.display().to_string());
        workspaces.chain(others).collect()
    }

    /// Human-readable summary of the managed paths.
    pub fn permission_summary(&self) -> String {
        let inner = self.inner.lock().expect("inner lock poisoned");
        if inner.managed.is_empty() {
            return "No managed paths configured".to_string();
        }
        let mut lines = vec![format!("Managed paths ({} total):", inner.managed.len())];
        for mp in &inner.managed {
            lines.push(format!(
                "  {} ({}, {})",
                mp.path.display(),
                mp.permission.as_str(),
                mp.kind.as_str()
            ));
        }
        lines.join("\n")
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Destination paths the batch copy would produce: every file under
/// `source_base` matching the include patterns (default: everything) and not
/// matching the exclude patterns, mapped to `destination_base`.
fn copy_destinations(
    source_base: &Path,
    destination_base: &Path,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> Result<Vec<PathBuf>, String> {
    if !source_base.exists() {
        return Err(format!("source path does not exist: {}", source_base.display()));
    }
    let include: Vec<String> = if include_patterns.is_empty() {
        vec!["**/*".to_string()]
    } else {
        include_patterns.to_vec()
    };
    let excludes: Vec<Pattern> = exclude_patterns
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut destinations = Vec::new();
    for pattern in include {
        let full = source_base.join(&pattern);
        let full_str = full.to_string_lossy().to_string();
        let entries = glob::glob(&full_str).map_err(|e| format!("bad pattern '{}': {}", pattern, e))?;
        for entry in entries.flatten() {
            if !entry.is_file() {
                continue;
            }
            let Ok(rel) = entry.strip_prefix(source_base) else {
                continue;
            };
            if excludes.iter().any(|p| p.matches_path(rel)) {
                continue;
            }
            destinations.push(lexical_normalize(&destination_base.join(rel)));
        }
    }
    Ok(destinations)
}

/// Best-effort extraction of the file a mutating command pattern targets.
fn extract_file_from_command(command: &str, pattern: &str) -> Option<String> {
    if pattern == ">" || pattern == ">>" {
        let mut parts = command.splitn(2, pattern);
        let _ = parts.next();
        let after = parts.next()?.trim();
        let target = after.split_whitespace().next()?;
        return Some(target.trim_matches(['"', '\'']).to_string());
    }

    let words: Vec<&str> = command.split_whitespace().collect();
    let keyword = pattern.trim();
    let idx = words.iter().position(|w| *w == keyword)?;

    match keyword {
        // Second argument is the destination.
        "mv" | "cp" | "move" | "copy" => words.get(idx + 2).map(|w| w.trim_matches(['"', '\'']).to_string()),
        // First argument is the target.
        "touch" | "mkdir" | "echo" => words.get(idx + 1).map(|w| w.trim_matches(['"', '\'']).to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_with_workspace(workspace: &Path) -> PathPermissionManager {
        let manager = PathPermissionManager::new(false);
        manager.add_path(workspace, Permission::Write, PathKind::Workspace);
        manager
    }

    #[test]
    fn workspace_is_writable_and_overrides_exclusions() {
        let manager = manager_with_workspace(Path::new("/work"));
        assert_eq!(
            manager.get_permission(Path::new("/work/a.txt")),
            Some(Permission::Write)
        );
        // Exclusion patterns do not force read-only inside a workspace.
        assert_eq!(
            manager.get_permission(Path::new("/work/.env")),
            Some(Permission::Write)
        );
        // Outside any workspace the pattern always excludes.
        assert_eq!(
            manager.get_permission(Path::new("/elsewhere/.git/config")),
            Some(Permission::Read)
        );
    }

    #[test]
    fn context_paths_are_read_only_until_write_access_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = dir.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_context_paths(&[ContextPathConfig {
            path: ctx.display().to_string(),
            permission: Permission::Write,
            protected_paths: vec![],
        }]);

        let file = ctx.join("x.txt");
        assert_eq!(manager.get_permission(&file), Some(Permission::Read));

        manager.set_context_write_access_enabled(true);
        assert_eq!(manager.get_permission(&file), Some(Permission::Write));

        manager.set_context_write_access_enabled(false);
        assert_eq!(manager.get_permission(&file), Some(Permission::Read));
    }

    #[test]
    fn protected_subpaths_stay_read_only_under_writable_parent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = dir.path().join("proj");
        std::fs::create_dir_all(ctx.join("tests/do-not-touch")).unwrap();

        let manager = PathPermissionManager::new(true);
        manager.add_context_paths(&[ContextPathConfig {
            path: ctx.display().to_string(),
            permission: Permission::Write,
            protected_paths: vec!["tests/do-not-touch".into()],
        }]);

        assert_eq!(
            manager.get_permission(&ctx.join("src/main.rs")),
            Some(Permission::Write)
        );
        assert_eq!(
            manager.get_permission(&ctx.join("tests/do-not-touch/fixture.json")),
            Some(Permission::Read)
        );
    }

    #[test]
    fn file_context_grants_only_that_file() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("assets");
        std::fs::create_dir_all(&parent).unwrap();
        let logo = parent.join("logo.png");
        std::fs::write(&logo, b"png").unwrap();
        std::fs::write(parent.join("secret.txt"), b"s").unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_context_paths(&[ContextPathConfig {
            path: logo.display().to_string(),
            permission: Permission::Read,
            protected_paths: vec![],
        }]);

        assert_eq!(manager.get_permission(&logo), Some(Permission::Read));
        // Sibling confers no permission...
        assert_eq!(manager.get_permission(&parent.join("secret.txt")), None);
        // ...and the hook denies reading it.
        let (allowed, reason) = manager.pre_tool_use_hook(
            "read_file",
            &json!({"path": parent.join("secret.txt").display().to_string()}),
        );
        assert!(!allowed);
        assert!(reason.unwrap().contains("not an explicitly allowed file"));
        // The parent dir is still in the MCP path list so the server can
        // reach the allowed file.
        assert!(manager
            .mcp_filesystem_paths()
            .contains(&parent.display().to_string()));
    }

    #[test]
    fn write_tool_denied_on_read_only_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = dir.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_context_paths(&[ContextPathConfig {
            path: ctx.display().to_string(),
            permission: Permission::Write,
            protected_paths: vec![],
        }]);

        let target = ctx.join("x");
        let (allowed, reason) = manager.pre_tool_use_hook(
            "mcp__filesystem__write_file",
            &json!({"path": target.display().to_string(), "contents": "y"}),
        );
        assert!(!allowed);
        let reason = reason.unwrap();
        assert!(
            reason.contains("No write permission") && reason.contains("read-only context path"),
            "unexpected reason: {}",
            reason
        );
    }

    #[test]
    fn read_tools_and_unknown_paths_are_permitted() {
        let manager = manager_with_workspace(Path::new("/work"));
        let (allowed, _) =
            manager.pre_tool_use_hook("read_file", &json!({"path": "/somewhere/else.txt"}));
        assert!(allowed);
        let (allowed, _) = manager.pre_tool_use_hook("list_directory", &json!({}));
        assert!(allowed);
    }

    #[test]
    fn relative_paths_resolve_against_first_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = dir.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_path(&ctx, Permission::Read, PathKind::Workspace);
        // Workspace writable would allow; make a read-only previous-turn dir
        // the workspace to prove resolution happens.
        let (allowed, _) = manager.pre_tool_use_hook("write_file", &json!({"path": "sub/out.txt"}));
        // Resolved into the (read-only) workspace → denied.
        assert!(!allowed);
    }

    #[test]
    fn command_tool_dangerous_patterns_always_denied() {
        let manager = manager_with_workspace(Path::new("/work"));
        for command in ["rm -rf /", "sudo make install", "mkfs.ext4 /dev/sda1"] {
            let (allowed, reason) =
                manager.pre_tool_use_hook("Bash", &json!({"command": command}));
            assert!(!allowed, "expected deny for {}", command);
            assert!(reason.unwrap().contains("not allowed"));
        }
    }

    #[test]
    fn command_tool_mutation_into_read_only_path_denied() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = dir.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_context_paths(&[ContextPathConfig {
            path: ctx.display().to_string(),
            permission: Permission::Read,
            protected_paths: vec![],
        }]);

        let target = ctx.join("out.txt");
        let (allowed, reason) = manager.pre_tool_use_hook(
            "Bash",
            &json!({"command": format!("echo hi > {}", target.display())}),
        );
        assert!(!allowed);
        assert!(reason.unwrap().contains("read-only context path"));

        let (allowed, _) = manager.pre_tool_use_hook(
            "Bash",
            &json!({"command": format!("touch {}", target.display())}),
        );
        assert!(!allowed);

        // Mutations inside the workspace are fine.
        let manager = manager_with_workspace(Path::new("/work"));
        let (allowed, _) = manager.pre_tool_use_hook(
            "Bash",
            &json!({"command": "echo hi > /work/out.txt"}),
        );
        assert!(allowed);
    }

    #[test]
    fn copy_files_batch_checks_every_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        std::fs::write(src.join("b.log"), b"b").unwrap();
        let ctx = dir.path().join("ctx");
        std::fs::create_dir_all(&ctx).unwrap();

        let manager = PathPermissionManager::new(false);
        manager.add_context_paths(&[ContextPathConfig {
            path: ctx.display().to_string(),
            permission: Permission::Read,
            protected_paths: vec![],
        }]);

        let (allowed, reason) = manager.pre_tool_use_hook(
            "copy_files_batch",
            &json!({
                "source_base_path": src.display().to_string(),
                "destination_base_path": ctx.display().to_string(),
            }),
        );
        assert!(!allowed);
        assert!(reason.unwrap().contains("No write permission for destination paths"));

        // Excluding everything blocked leaves nothing to deny.
        let (allowed, _) = manager.pre_tool_use_hook(
            "copy_files_batch",
            &json!({
                "source_base_path": src.display().to_string(),
                "destination_base_path": dir.path().join("free").display().to_string(),
            }),
        );
        assert!(allowed);
    }

    #[test]
    fn deepest_directory_wins() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("outer");
        let inner = outer.join("inner");
        std::fs::create_dir_all(&inner).unwrap();

        let manager = PathPermissionManager::new(true);
        manager.add_context_paths(&[
            ContextPathConfig {
                path: outer.display().to_string(),
                permission: Permission::Write,
                protected_paths: vec![],
            },
            ContextPathConfig {
                path: inner.display().to_string(),
                permission: Permission::Read,
                protected_paths: vec![],
            },
        ]);

        assert_eq!(
            manager.get_permission(&outer.join("x.txt")),
            Some(Permission::Write)
        );
        assert_eq!(
            manager.get_permission(&inner.join("x.txt")),
            Some(Permission::Read)
        );
    }

    #[test]
    fn extract_file_from_command_variants() {
        assert_eq!(
            extract_file_from_command("echo hi > /tmp/x.txt", ">").as_deref(),
            Some("/tmp/x.txt")
        );
        assert_eq!(
            extract_file_from_command("cat a >> '/tmp/y.txt'", ">>").as_deref(),
            Some("/tmp/y.txt")
        );
        assert_eq!(
            extract_file_from_command("mv a.txt /dest/b.txt", "mv ").as_deref(),
            Some("/dest/b.txt")
        );
        assert_eq!(
            extract_file_from_command("touch /tmp/new.txt", "touch ").as_deref(),
            Some("/tmp/new.txt")
        );
        assert_eq!(extract_file_from_command("ls -la", "mv "), None);
    }
}
