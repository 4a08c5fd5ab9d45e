//! The embedded interpreter seam.
//!
//! A [`GuestEngine`] runs one guest invocation: a fresh interpreter instance
//! that sees only the preopened directories it is handed, reads a typed
//! [`GuestRequest`] from stdin, and writes its result envelope to stdout.
//! [`wasi::WasiPythonEngine`] is the production engine; `crate::fakes` has a
//! scripted one for tests.

pub mod wasi;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use wasi::WasiPythonEngine;

/// Guest directory holding driver, policy, and installer (read-only).
pub const RUNTIME_GUEST_DIR: &str = "/.runtime";
/// Private per-session temporary directory.
pub const TMP_GUEST_DIR: &str = "/tmp";
/// Per-session install target.
pub const SITE_PACKAGES_GUEST_DIR: &str = "/site-packages";
/// Where staged wheels appear inside the guest.
pub const WHEELS_GUEST_DIR: &str = "/tmp/wheels";

pub const DRIVER_FILE: &str = "driver.py";
pub const POLICY_FILE: &str = "policy.json";

/// Source of the in-guest driver.
pub const DRIVER_SOURCE: &str = include_str!("../../assets/driver.py");
/// Source of the in-guest fallback installer module.
pub const INSTALLER_SOURCE: &str = include_str!("../../assets/installer.py");

/// What the driver is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GuestRequest {
    /// Apply the policy and report interpreter facts.
    Probe,
    /// Run user code under output capture.
    Execute {
        code: String,
        workdir: Option<String>,
        reset_globals: bool,
        max_output_bytes: usize,
    },
    /// Install one staged wheel through the fallback installer.
    Install { wheel: String, target: String },
}

impl GuestRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            GuestRequest::Probe => "probe",
            GuestRequest::Execute { .. } => "execute",
            GuestRequest::Install { .. } => "install",
        }
    }
}

/// A host directory exposed to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preopen {
    pub host: PathBuf,
    pub guest: String,
    pub writable: bool,
}

impl Preopen {
    pub fn read_only(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            writable: false,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            writable: true,
        }
    }
}

/// Resource bounds for one guest invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLimits {
    /// Linear-memory ceiling.
    pub memory_bytes: u64,
    /// Wall-clock budget measured from the start of the invocation.
    pub deadline: Duration,
}

/// Shared flag that interrupts a running guest at its next epoch tick.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a single guest run needs.
#[derive(Debug, Clone)]
pub struct GuestInvocation {
    pub request: GuestRequest,
    pub preopens: Vec<Preopen>,
    pub env: Vec<(String, String)>,
    pub limits: GuestLimits,
    pub cancel: CancelFlag,
}

/// Raw result of a guest run that reached its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("interpreter unavailable: {0}")]
    Unavailable(String),

    #[error("guest setup failed: {0}")]
    Setup(String),

    #[error("guest cancelled")]
    Cancelled,

    #[error("Execution timeout: exceeded {limit_ms}ms")]
    DeadlineExceeded { limit_ms: u64 },

    #[error("guest trapped: {0}")]
    Trap(String),

    #[error("guest worker exited unexpectedly: {0}")]
    Worker(String),
}

/// The embedded interpreter.
#[async_trait]
pub trait GuestEngine: Send + Sync {
    /// Run one invocation to completion, cancellation, or deadline.
    async fn run(&self, invocation: GuestInvocation) -> Result<GuestOutcome, GuestError>;

    /// Short identifier used in logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = GuestRequest::Execute {
            code: "1+1".into(),
            workdir: Some("/sandbox/s1".into()),
            reset_globals: true,
            max_output_bytes: 10,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["mode"], "execute");
        assert_eq!(json["code"], "1+1");
        assert_eq!(serde_json::to_value(GuestRequest::Probe).unwrap()["mode"], "probe");
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_driver_assets_are_embedded() {
        assert!(DRIVER_SOURCE.contains("policy.json"));
        assert!(INSTALLER_SOURCE.contains("def install_wheel"));
    }
}
