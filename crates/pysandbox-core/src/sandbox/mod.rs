//! Session sandboxing: runtimes, policy, mounts, and isolated execution.
//!
//! - [`SessionRegistry`] hands out one [`SandboxRuntime`] per session id.
//! - [`SandboxRuntime`] owns the session's guest workspace and mount, applies
//!   the [`CapabilityPolicy`] at startup, and runs scripts under output capture.
//! - [`WorkerExecutor`] runs each execution in its own task with a hard
//!   timeout and guaranteed teardown.
//! - [`MountGuard`] validates host paths before they are bound into the guest.

pub mod capability;
pub mod capture;
pub mod mount;
pub mod policy;
pub mod registry;
pub mod request;
pub mod runtime;
pub mod worker;

pub use capability::HostBridge;
pub use capture::{CapturedRun, GuestEnvelope};
pub use mount::{MountError, MountGuard, MountPoint};
pub use policy::{CapabilityPolicy, CapabilityRule, INSTALL_DISABLED, NETWORK_DISABLED};
pub use registry::SessionRegistry;
pub use request::{ExecutionRequest, ExecutionResult};
pub use runtime::{MountEntry, RuntimePhase, SandboxContext, SandboxRuntime};
pub use worker::WorkerExecutor;
