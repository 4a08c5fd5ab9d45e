//! Sandbox configuration: defaults plus environment overlay.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::packages::AllowList;

/// Environment variable naming the wheel/package cache root.
pub const ENV_CACHE_DIR: &str = "PYTHON_CACHE_DIR";
/// Environment variable naming the host directory mounted per session.
pub const ENV_DATA_DIR: &str = "PYTHON_DATA_DIR";
pub const ENV_PYTHON_WASM: &str = "PYTHON_WASM";
pub const ENV_STDLIB_DIR: &str = "PYTHON_STDLIB_DIR";
pub const ENV_STDLIB_GUEST_PATH: &str = "PYTHON_STDLIB_GUEST_PATH";
pub const ENV_PACKAGES_DIR: &str = "PYTHON_PACKAGES_DIR";
pub const ENV_INDEX_URL: &str = "PYTHON_INDEX_URL";
pub const ENV_SANDBOX_BASE: &str = "PYTHON_SANDBOX_BASE";
pub const ENV_HEAP_LIMIT_MB: &str = "PYTHON_HEAP_LIMIT_MB";
pub const ENV_MAX_OUTPUT_BYTES: &str = "PYTHON_MAX_OUTPUT_BYTES";
pub const ENV_ALLOWED_PACKAGES: &str = "PYTHON_ALLOWED_PACKAGES";

/// Errors raised while building a [`SandboxConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be an absolute guest path, got {value:?}")]
    InvalidGuestPath { var: &'static str, value: String },

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Configuration shared by every session in the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxConfig {
    /// Flat wheel cache, keyed by wheel filename.
    pub cache_dir: PathBuf,
    /// Host root; `{data_dir}/{session_id}` is mounted into each session.
    pub data_dir: PathBuf,
    /// Guest-side parent of every session mount.
    pub sandbox_base_path: String,
    /// CPython WASI build.
    pub python_wasm: PathBuf,
    /// Host directory holding the interpreter's standard library.
    pub stdlib_dir: PathBuf,
    /// Where the standard library appears inside the guest.
    pub stdlib_guest_path: String,
    /// Natively loadable packages bundled with the runtime, one directory per distribution.
    pub packages_dir: Option<PathBuf>,
    /// Base URL of the JSON package index.
    pub index_url: String,
    /// Linear-memory ceiling for a single guest invocation.
    pub heap_limit_bytes: u64,
    /// Cap on captured stdout/stderr per execution.
    pub max_output_bytes: usize,
    pub allowed_packages: AllowList,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            data_dir: PathBuf::from("./data"),
            sandbox_base_path: "/sandbox".to_string(),
            python_wasm: PathBuf::from("./runtime/python.wasm"),
            stdlib_dir: PathBuf::from("./runtime/lib"),
            stdlib_guest_path: "/usr/local/lib/python3.12".to_string(),
            packages_dir: None,
            index_url: "https://pypi.org".to_string(),
            heap_limit_bytes: 512 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            allowed_packages: AllowList::default(),
        }
    }
}

impl SandboxConfig {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, starting from [`Default`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_CACHE_DIR) {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_PYTHON_WASM) {
            cfg.python_wasm = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_STDLIB_DIR) {
            cfg.stdlib_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_STDLIB_GUEST_PATH) {
            cfg.stdlib_guest_path = guest_path(ENV_STDLIB_GUEST_PATH, v)?;
        }
        if let Some(v) = get(ENV_PACKAGES_DIR) {
            cfg.packages_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_INDEX_URL) {
            cfg.index_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get(ENV_SANDBOX_BASE) {
            cfg.sandbox_base_path = guest_path(ENV_SANDBOX_BASE, v)?;
        }
        if let Some(v) = get(ENV_HEAP_LIMIT_MB) {
            cfg.heap_limit_bytes = positive(ENV_HEAP_LIMIT_MB, &v)? * 1024 * 1024;
        }
        if let Some(v) = get(ENV_MAX_OUTPUT_BYTES) {
            cfg.max_output_bytes = positive(ENV_MAX_OUTPUT_BYTES, &v)? as usize;
        }
        if let Some(v) = get(ENV_ALLOWED_PACKAGES) {
            cfg.allowed_packages = AllowList::parse(&v).map_err(|reason| ConfigError::Invalid {
                var: ENV_ALLOWED_PACKAGES,
                reason,
            })?;
        }

        Ok(cfg)
    }

    /// Guest path at which `session_id`'s host directory is mounted.
    pub fn sandbox_path_for(&self, session_id: &str) -> String {
        format!(
            "{}/{}",
            self.sandbox_base_path.trim_end_matches('/'),
            session_id
        )
    }

    /// Host directory mounted for `session_id`.
    pub fn host_path_for(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(session_id)
    }
}

fn positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        }),
    }
}

fn guest_path(var: &'static str, value: String) -> Result<String, ConfigError> {
    if !value.starts_with('/') || value.contains("..") {
        return Err(ConfigError::InvalidGuestPath { var, value });
    }
    let trimmed = value.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = SandboxConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, SandboxConfig::default());
        assert_eq!(cfg.cache_dir, PathBuf::from("./cache"));
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.heap_limit_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn test_env_overlay() {
        let cfg = SandboxConfig::from_lookup(lookup(&[
            (ENV_CACHE_DIR, "/var/cache/py"),
            (ENV_DATA_DIR, "/srv/data"),
            (ENV_HEAP_LIMIT_MB, "64"),
            (ENV_INDEX_URL, "http://localhost:8080/"),
            (ENV_SANDBOX_BASE, "/mnt/"),
        ]))
        .unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/py"));
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(cfg.heap_limit_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.index_url, "http://localhost:8080");
        assert_eq!(cfg.sandbox_path_for("s1"), "/mnt/s1");
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let cfg = SandboxConfig::from_lookup(lookup(&[(ENV_CACHE_DIR, "  ")])).unwrap();
        assert_eq!(cfg.cache_dir, PathBuf::from("./cache"));
    }

    #[test]
    fn test_rejects_zero_heap() {
        let err = SandboxConfig::from_lookup(lookup(&[(ENV_HEAP_LIMIT_MB, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn test_rejects_relative_sandbox_base() {
        let err =
            SandboxConfig::from_lookup(lookup(&[(ENV_SANDBOX_BASE, "mnt/data")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGuestPath { .. }));
    }

    #[test]
    fn test_allowed_packages_override() {
        let cfg =
            SandboxConfig::from_lookup(lookup(&[(ENV_ALLOWED_PACKAGES, "numpy, sklearn=scikit-learn")]))
                .unwrap();
        assert_eq!(cfg.allowed_packages.distribution("sklearn"), Some("scikit-learn"));
        assert_eq!(cfg.allowed_packages.distribution("pandas"), None);
    }

    #[test]
    fn test_session_paths() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.sandbox_path_for("abc"), "/sandbox/abc");
        assert_eq!(cfg.host_path_for("abc"), PathBuf::from("./data/abc"));
    }
}
