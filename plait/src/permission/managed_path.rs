//! One managed path: a directory root or a single context file, its policy,
//! and the protected subpaths inside it.

use std::path::{Component, Path, PathBuf};

use super::Permission;

/// What role a managed path plays; resolution priority depends on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathKind {
    /// Per-agent mutable root; always writable, exclusion patterns do not
    /// apply inside it.
    Workspace,
    /// Shared snapshots from other agents; read-only.
    TempWorkspace,
    /// User-declared context directory or file.
    Context,
    /// Parent directory of a file context path. Grants MCP access to the
    /// directory but confers no permission on its other files.
    FileContextParent,
    /// Previous-turn workspace snapshot; read-only.
    PreviousTurn,
}

impl PathKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::TempWorkspace => "temp_workspace",
            Self::Context => "context",
            Self::FileContextParent => "file_context_parent",
            Self::PreviousTurn => "previous_turn",
        }
    }
}

/// Normalizes a path lexically: strips `.` components and folds `..` without
/// touching the filesystem, so queries about not-yet-created paths still
/// resolve.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// One managed path with its permission and type.
#[derive(Clone, Debug)]
pub struct ManagedPath {
    pub path: PathBuf,
    pub permission: Permission,
    pub kind: PathKind,
    /// True when this context path becomes writable for the final agent.
    pub will_be_writable: bool,
    /// True when this is a file-specific context path, not a directory.
    pub is_file: bool,
    /// Subpaths immune from modification regardless of the parent policy.
    pub protected_paths: Vec<PathBuf>,
}

impl ManagedPath {
    pub fn new(path: PathBuf, permission: Permission, kind: PathKind) -> Self {
        Self {
            path: lexical_normalize(&path),
            permission,
            kind,
            will_be_writable: false,
            is_file: false,
            protected_paths: Vec::new(),
        }
    }

    /// Whether this managed path contains the (normalized) query path. File
    /// paths match exactly; directories match themselves and any descendant.
    pub fn contains(&self, check: &Path) -> bool {
        let check = lexical_normalize(check);
        if self.is_file {
            return check == self.path;
        }
        check.starts_with(&self.path)
    }

    /// Whether the query path is one of (or inside one of) the protected
    /// subpaths.
    pub fn is_protected(&self, check: &Path) -> bool {
        let check = lexical_normalize(check);
        self.protected_paths
            .iter()
            .any(|protected| check == *protected || check.starts_with(protected))
    }

    /// Directory depth used to rank containing paths (deepest wins).
    pub fn depth(&self) -> usize {
        self.path.components().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_normalize_folds_dots() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(lexical_normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn directory_contains_descendants_and_itself() {
        let mp = ManagedPath::new("/work".into(), Permission::Write, PathKind::Workspace);
        assert!(mp.contains(Path::new("/work")));
        assert!(mp.contains(Path::new("/work/sub/file.txt")));
        assert!(!mp.contains(Path::new("/workother/file.txt")));
        assert!(!mp.contains(Path::new("/elsewhere")));
    }

    #[test]
    fn file_path_matches_exactly() {
        let mut mp = ManagedPath::new("/ctx/logo.png".into(), Permission::Read, PathKind::Context);
        mp.is_file = true;
        assert!(mp.contains(Path::new("/ctx/logo.png")));
        assert!(!mp.contains(Path::new("/ctx/other.png")));
        assert!(!mp.contains(Path::new("/ctx")));
    }

    #[test]
    fn protected_paths_cover_subtrees() {
        let mut mp = ManagedPath::new("/proj".into(), Permission::Write, PathKind::Context);
        mp.protected_paths = vec![PathBuf::from("/proj/tests/do-not-touch")];
        assert!(mp.is_protected(Path::new("/proj/tests/do-not-touch")));
        assert!(mp.is_protected(Path::new("/proj/tests/do-not-touch/inner.txt")));
        assert!(!mp.is_protected(Path::new("/proj/tests/ok.txt")));
    }
}
