//! Error taxonomy for the sandbox engine.
//!
//! Per-package and per-mount failures are converted into structured result
//! fields at the public surface; these types are what flows underneath.

use crate::guest::GuestError;
use crate::packages::PackageError;
use crate::sandbox::mount::MountError;

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("runtime initialization failed: {0}")]
    InitializationFailed(String),

    #[error("{0} not initialized")]
    NotInitialized(&'static str),

    #[error("{reason}")]
    PolicyViolation { reason: String },

    #[error("Execution timeout: exceeded {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("mount rejected: {0}")]
    MountRejected(#[from] MountError),

    #[error("mount point {0} does not exist")]
    MountPointAbsent(String),

    #[error("package resolution failed for {package}: {source}")]
    PackageResolution {
        package: String,
        #[source]
        source: PackageError,
    },

    #[error("worker failed: {0}")]
    Transport(String),

    #[error("interpreter error: {0}")]
    Guest(#[from] GuestError),

    #[error("invalid session id {0:?}")]
    InvalidSession(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_initialized_display() {
        let err = SandboxError::NotInitialized("Sandbox runtime");
        assert_eq!(err.to_string(), "Sandbox runtime not initialized");
    }

    #[test]
    fn test_timeout_display_carries_limit() {
        let err = SandboxError::Timeout { limit_ms: 250 };
        let msg = err.to_string();
        assert!(msg.contains("Execution timeout"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn test_policy_violation_is_verbatim() {
        let err = SandboxError::PolicyViolation {
            reason: "Package installation disabled".into(),
        };
        assert_eq!(err.to_string(), "Package installation disabled");
    }
}
