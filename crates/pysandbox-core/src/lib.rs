//! pysandbox core library
//!
//! Per-session sandboxed Python execution: an embedded CPython/WASI guest per
//! call, a declarative capability policy, validated session mounts, and an
//! allow-listed package pipeline, exposed through the `python_execute` and
//! `list_mounted_directory` tools.

pub mod config;
pub mod error;
pub mod fakes;
pub mod guest;
pub mod metrics;
pub mod obs;
pub mod packages;
pub mod sandbox;
pub mod telemetry;
pub mod tools;

pub use config::{ConfigError, SandboxConfig};
pub use error::{SandboxError, SandboxResult};
pub use guest::{GuestEngine, GuestError, WasiPythonEngine};
pub use packages::{
    scan_imports, AllowList, InstallAttempt, InstallOutcome, InstallStrategy, PackageError,
    PackageIndex, PackageResolver, PackageSpec, PypiIndex, WheelCache,
};
pub use sandbox::{
    CapabilityPolicy, CapabilityRule, ExecutionRequest, ExecutionResult, HostBridge, MountGuard,
    MountPoint, RuntimePhase, SandboxContext, SandboxRuntime, SessionRegistry, WorkerExecutor,
};
pub use tools::{SandboxTools, ToolResponse};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire up the production stack from `config`: the WASI interpreter and a
/// PyPI-backed resolver.
pub fn build_registry(config: SandboxConfig) -> SandboxResult<std::sync::Arc<SessionRegistry>> {
    use std::sync::Arc;

    let engine = Arc::new(WasiPythonEngine::from_config(&config)?);
    let resolver = Arc::new(PackageResolver::from_config(&config).map_err(|e| {
        SandboxError::InitializationFailed(format!("package resolver unavailable: {e}"))
    })?);
    let context = SandboxContext::new(config, engine, resolver);
    Ok(Arc::new(SessionRegistry::new(context)))
}
