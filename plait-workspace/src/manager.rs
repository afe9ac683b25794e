//! Per-agent workspace lifecycle: creation, start-of-turn clearing, snapshots,
//! and temp-workspace restoration for context sharing between agents.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use plait::permission::{ContextPathConfig, PathKind, PathPermissionManager, Permission};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("refusing unsafe workspace path: {0}")]
    UnsafePath(String),
    #[error("workspace io: {0}")]
    Io(#[from] std::io::Error),
}

/// Owns one agent's workspace tree and the permission manager seeded from it.
///
/// **Interaction**: constructed before backend setup; its permission manager
/// is installed on the backend runner as the pre-call hook, and
/// [`BackendConfigBuilder`](crate::BackendConfigBuilder) reads its path lists
/// when generating server specs.
pub struct FilesystemManager {
    workspace: PathBuf,
    agent_id: String,
    temp_workspace: Option<PathBuf>,
    permissions: Arc<PathPermissionManager>,
}

impl FilesystemManager {
    /// Creates (and clears) the workspace and registers it as writable.
    ///
    /// Paths shorter than three components, or `/` itself, are refused
    /// outright: a cleared workspace must never be a system root.
    pub fn new(
        workspace: &Path,
        agent_id: impl Into<String>,
        context_write_access_enabled: bool,
    ) -> Result<Self, WorkspaceError> {
        let workspace = setup_workspace(workspace)?;
        let permissions = Arc::new(PathPermissionManager::new(context_write_access_enabled));
        permissions.add_path(&workspace, Permission::Write, PathKind::Workspace);
        Ok(Self {
            workspace,
            agent_id: agent_id.into(),
            temp_workspace: None,
            permissions,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn permission_manager(&self) -> Arc<PathPermissionManager> {
        Arc::clone(&self.permissions)
    }

    /// Registers user context paths (directories or single files).
    pub fn add_context_paths(&self, configs: &[ContextPathConfig]) {
        self.permissions.add_context_paths(configs);
    }

    /// Registers previous-turn workspaces, always read-only.
    pub fn add_previous_turn_paths(&self, paths: &[PathBuf]) {
        self.permissions.add_previous_turn_paths(paths);
    }

    /// Grants the final agent write access to context paths declared writable.
    pub fn enable_write_access(&self) {
        self.permissions.set_context_write_access_enabled(true);
    }

    /// Empties the workspace without removing its root.
    pub fn clear_workspace(&self) -> Result<(), WorkspaceError> {
        clear_directory(&self.workspace)?;
        info!(workspace = %self.workspace.display(), "cleared workspace");
        Ok(())
    }

    /// Copies the workspace to `<snapshot_root>/<agent_id>/`, replacing any
    /// previous snapshot. When `log_session_root` is given, an immutable
    /// timestamped copy also lands under
    /// `<log_session_root>/<agent_id>/<timestamp>/workspace/`.
    pub fn save_snapshot(
        &self,
        snapshot_root: &Path,
        log_session_root: Option<&Path>,
    ) -> Result<PathBuf, WorkspaceError> {
        let destination = snapshot_root.join(&self.agent_id);
        if destination.exists() {
            std::fs::remove_dir_all(&destination)?;
        }
        copy_tree(&self.workspace, &destination)?;
        info!(from = %self.workspace.display(), to = %destination.display(), "saved workspace snapshot");

        if let Some(log_root) = log_session_root {
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
            let log_copy = log_root
                .join(&self.agent_id)
                .join(timestamp)
                .join("workspace");
            copy_tree(&self.workspace, &log_copy)?;
            debug!(to = %log_copy.display(), "saved log-session workspace copy");
        }

        Ok(destination)
    }

    /// Restores other agents' snapshots into this agent's temp workspace for
    /// context sharing: `<temp_parent>/<agent_id>/<anon_id>/…`. The temp
    /// workspace is registered read-only. Returns the temp workspace path, or
    /// `None` when there was nothing to share.
    pub fn copy_snapshots_to_temp_workspace(
        &mut self,
        temp_parent: &Path,
        snapshots: &HashMap<String, PathBuf>,
        anon_ids: &HashMap<String, String>,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        let mut restored = 0usize;
        let temp_workspace = temp_parent.join(&self.agent_id);
        for (agent_id, snapshot) in snapshots {
            if *agent_id == self.agent_id {
                continue;
            }
            let Some(anon_id) = anon_ids.get(agent_id) else {
                warn!(agent = %agent_id, "no anonymous id for agent, skipping snapshot");
                continue;
            };
            if !snapshot.is_dir() {
                warn!(snapshot = %snapshot.display(), "snapshot missing, skipping");
                continue;
            }
            copy_tree(snapshot, &temp_workspace.join(anon_id))?;
            restored += 1;
        }

        if restored == 0 {
            return Ok(None);
        }
        self.permissions
            .add_path(&temp_workspace, Permission::Read, PathKind::TempWorkspace);
        self.temp_workspace = Some(temp_workspace.clone());
        info!(count = restored, temp = %temp_workspace.display(), "restored snapshots into temp workspace");
        Ok(Some(temp_workspace))
    }

    pub fn temp_workspace(&self) -> Option<&Path> {
        self.temp_workspace.as_deref()
    }
}

/// Resolves, sanity-checks, creates and clears the workspace directory.
fn setup_workspace(path: &Path) -> Result<PathBuf, WorkspaceError> {
    let workspace = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(WorkspaceError::Io)?
            .join(path)
    };
    let components = workspace
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count();
    if workspace == Path::new("/") || components < 2 {
        return Err(WorkspaceError::UnsafePath(workspace.display().to_string()));
    }

    std::fs::create_dir_all(&workspace)?;
    clear_directory(&workspace)?;
    Ok(workspace)
}

fn clear_directory(dir: &Path) -> Result<(), WorkspaceError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_symlink() {
            warn!(path = %path.display(), "removing symlink during clear");
            std::fs::remove_file(&path)?;
        } else if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Recursive copy; symlinks are skipped with a warning.
fn copy_tree(from: &Path, to: &Path) -> Result<(), WorkspaceError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let destination = to.join(entry.file_name());
        if source.is_symlink() {
            warn!(path = %source.display(), "skipping symlink during copy");
        } else if source.is_dir() {
            copy_tree(&source, &destination)?;
        } else {
            std::fs::copy(&source, &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_root_and_shallow_paths() {
        assert!(matches!(
            FilesystemManager::new(Path::new("/"), "a1", false),
            Err(WorkspaceError::UnsafePath(_))
        ));
        assert!(matches!(
            FilesystemManager::new(Path::new("/tmp"), "a1", false),
            Err(WorkspaceError::UnsafePath(_))
        ));
    }

    #[test]
    fn creates_clears_and_registers_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("agent/workspace");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("stale.txt"), b"old").unwrap();

        let manager = FilesystemManager::new(&ws, "a1", false).unwrap();
        // Start-of-turn clear removed prior contents.
        assert!(std::fs::read_dir(&ws).unwrap().next().is_none());
        assert_eq!(
            manager.permission_manager().get_permission(&ws.join("new.txt")),
            Some(Permission::Write)
        );
    }

    #[test]
    fn snapshot_round_trips_workspace_contents() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("agents/a1/workspace");
        let manager = FilesystemManager::new(&ws, "a1", false).unwrap();

        std::fs::create_dir_all(ws.join("sub")).unwrap();
        std::fs::write(ws.join("sub/out.txt"), b"result").unwrap();

        let snapshots = dir.path().join("snapshots");
        let saved = manager.save_snapshot(&snapshots, None).unwrap();
        assert_eq!(saved, snapshots.join("a1"));
        assert_eq!(
            std::fs::read_to_string(saved.join("sub/out.txt")).unwrap(),
            "result"
        );
    }

    #[test]
    fn temp_workspace_restores_other_agents_under_anon_ids() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("agents/a1/workspace");
        let mut manager = FilesystemManager::new(&ws, "a1", false).unwrap();

        let other_snapshot = dir.path().join("snapshots/a2");
        std::fs::create_dir_all(&other_snapshot).unwrap();
        std::fs::write(other_snapshot.join("answer.md"), b"42").unwrap();

        let snapshots = HashMap::from([
            ("a1".to_string(), dir.path().join("snapshots/a1")),
            ("a2".to_string(), other_snapshot),
        ]);
        let anon = HashMap::from([
            ("a1".to_string(), "agent_x".to_string()),
            ("a2".to_string(), "agent_y".to_string()),
        ]);

        let temp_parent = dir.path().join("temp");
        let temp = manager
            .copy_snapshots_to_temp_workspace(&temp_parent, &snapshots, &anon)
            .unwrap()
            .unwrap();
        assert_eq!(temp, temp_parent.join("a1"));
        // Own workspace is never restored into temp.
        assert!(!temp.join("agent_x").exists());
        assert_eq!(
            std::fs::read_to_string(temp.join("agent_y/answer.md")).unwrap(),
            "42"
        );
        // Temp workspace is read-only.
        assert_eq!(
            manager
                .permission_manager()
                .get_permission(&temp.join("agent_y/answer.md")),
            Some(Permission::Read)
        );
    }

    #[test]
    fn save_snapshot_writes_log_session_copy() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("agents/a1/workspace");
        let manager = FilesystemManager::new(&ws, "a1", false).unwrap();
        std::fs::write(ws.join("f.txt"), b"x").unwrap();

        let logs = dir.path().join("logs");
        manager
            .save_snapshot(&dir.path().join("snapshots"), Some(&logs))
            .unwrap();
        let agent_logs: Vec<_> = std::fs::read_dir(logs.join("a1")).unwrap().collect();
        assert_eq!(agent_logs.len(), 1);
    }
}
