//! Mount validation: binding a session's host directory into the guest namespace.
//!
//! A mount is accepted only if both the requested host path and the configured
//! base path pass the denylist, and the canonical host path still lies under
//! the canonical base path. Symlinks and relative segments therefore cannot
//! smuggle a mount into a denied area.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A host directory bound into the sandbox namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    /// Canonical absolute host path.
    pub host_path: PathBuf,
    /// Absolute guest path, always `{sandbox_base}/{session_id}`.
    pub sandbox_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("{path} matches a denied location")]
    Denied { path: String },

    #[error("{path} resolves outside the allowed root {root}")]
    OutsideRoot { path: String, root: String },

    #[error("invalid session id {0:?}")]
    InvalidSession(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

static DENYLIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/etc|^/root|\.\./|/\.\.$").expect("denylist pattern is valid")
});

/// Validates mount requests against the denylist and the allowed root.
#[derive(Debug, Clone)]
pub struct MountGuard {
    allowed_root: PathBuf,
}

impl MountGuard {
    /// Guard whose canonical allow-root is `allowed_root`.
    pub fn new(allowed_root: impl Into<PathBuf>) -> Self {
        Self {
            allowed_root: allowed_root.into(),
        }
    }

    /// Literal check on the absolute, non-canonical form of `path`.
    pub fn check_literal(&self, path: &Path) -> Result<(), MountError> {
        let abs = absolutize(path)?;
        let text = abs.to_string_lossy();
        if DENYLIST.is_match(&text) {
            return Err(MountError::Denied {
                path: text.into_owned(),
            });
        }
        Ok(())
    }

    /// Canonicalize an existing `path` and require it to stay under the allowed root.
    pub fn check_canonical(&self, path: &Path) -> Result<PathBuf, MountError> {
        let canonical = canonicalize(path)?;
        let root = canonicalize(&self.allowed_root)?;

        let text = canonical.to_string_lossy();
        if DENYLIST.is_match(&text) {
            return Err(MountError::Denied {
                path: text.into_owned(),
            });
        }
        if canonical == root || !canonical.starts_with(&root) {
            return Err(MountError::OutsideRoot {
                path: text.into_owned(),
                root: root.to_string_lossy().into_owned(),
            });
        }
        Ok(canonical)
    }

    /// Validate, create, and resolve the mount for one session.
    ///
    /// Nothing is created on disk unless both literal checks pass.
    pub fn prepare(
        &self,
        session_id: &str,
        host_path: &Path,
        sandbox_path: String,
    ) -> Result<MountPoint, MountError> {
        validate_session_id(session_id)?;
        self.check_literal(host_path)?;
        self.check_literal(&self.allowed_root)?;

        std::fs::create_dir_all(host_path).map_err(|source| MountError::Io {
            path: host_path.display().to_string(),
            source,
        })?;
        let host_path = self.check_canonical(host_path)?;

        Ok(MountPoint {
            host_path,
            sandbox_path,
        })
    }
}

/// A session id must be exactly one normal path component.
pub fn validate_session_id(session_id: &str) -> Result<(), MountError> {
    let invalid = || MountError::InvalidSession(session_id.to_string());
    if session_id.is_empty() || session_id.len() > 128 || session_id.contains('\0') {
        return Err(invalid());
    }
    let mut components = Path::new(session_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !session_id.contains(['/', '\\']) => Ok(()),
        _ => Err(invalid()),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, MountError> {
    std::path::absolute(path).map_err(|source| MountError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn canonicalize(path: &Path) -> Result<PathBuf, MountError> {
    std::fs::canonicalize(path).map_err(|source| MountError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denylist_literals() {
        let guard = MountGuard::new("/tmp");
        for bad in ["/etc", "/etc/passwd", "/root", "/root/.ssh", "/tmp/a/../b", "/tmp/.."] {
            assert!(
                matches!(guard.check_literal(Path::new(bad)), Err(MountError::Denied { .. })),
                "{bad} should be denied"
            );
        }
        assert!(guard.check_literal(Path::new("/tmp/data/s1")).is_ok());
    }

    #[test]
    fn test_session_id_validation() {
        for ok in ["s1", "user-42", "a.b_c"] {
            assert!(validate_session_id(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", ".", "..", "a/b", "../x", "/abs", "a\\b"] {
            assert!(validate_session_id(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_prepare_creates_and_canonicalizes() {
        let root = tempfile::tempdir().unwrap();
        let guard = MountGuard::new(root.path());
        let host = root.path().join("s1");

        let mount = guard.prepare("s1", &host, "/sandbox/s1".into()).unwrap();
        assert!(host.is_dir());
        assert_eq!(mount.host_path, std::fs::canonicalize(&host).unwrap());
        assert_eq!(mount.sandbox_path, "/sandbox/s1");
    }

    #[test]
    fn test_prepare_rejects_traversal_without_creating() {
        let root = tempfile::tempdir().unwrap();
        let guard = MountGuard::new(root.path().join("data"));
        let host = root.path().join("data").join("..").join("escaped");

        assert!(guard.prepare("s1", &host, "/sandbox/s1".into()).is_err());
        assert!(!root.path().join("escaped").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_caught_by_canonical_check() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        let outside = root.path().join("outside");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, data.join("s1")).unwrap();

        let guard = MountGuard::new(&data);
        let err = guard
            .prepare("s1", &data.join("s1"), "/sandbox/s1".into())
            .unwrap_err();
        assert!(matches!(err, MountError::OutsideRoot { .. }));
    }

    #[test]
    fn test_root_itself_is_not_mountable() {
        let root = tempfile::tempdir().unwrap();
        let guard = MountGuard::new(root.path());
        assert!(matches!(
            guard.check_canonical(root.path()),
            Err(MountError::OutsideRoot { .. })
        ));
    }
}
