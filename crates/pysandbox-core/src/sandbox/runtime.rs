//! `SandboxRuntime`: one session's interpreter state.
//!
//! A runtime owns a private host workspace (the guest's `/.runtime`, `/tmp`
//! and `/site-packages`), the session's mount, and the capability policy
//! applied inside every guest run. Initialization is gated so concurrent
//! callers observe a single setup pass.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::capability::HostBridge;
use super::capture::CapturedRun;
use super::mount::{MountGuard, MountPoint};
use super::policy::{
    find_installer_token, CapabilityPolicy, INSTALLER_MODULE, INSTALL_DISABLED, NETWORK_DISABLED,
};
use super::request::ExecutionResult;
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::guest::{
    CancelFlag, GuestEngine, GuestError, GuestInvocation, GuestLimits, GuestRequest, Preopen,
    DRIVER_FILE, DRIVER_SOURCE, INSTALLER_SOURCE, POLICY_FILE, RUNTIME_GUEST_DIR,
    SITE_PACKAGES_GUEST_DIR, TMP_GUEST_DIR,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::packages::{InstallOutcome, PackageError, PackageResolver, SessionPaths, WheelInstaller};

/// Budget for the startup probe.
const PROBE_DEADLINE: Duration = Duration::from_secs(30);
/// Budget for one fallback wheel install.
const INSTALL_DEADLINE: Duration = Duration::from_secs(120);

/// Everything a runtime shares with its siblings in the registry.
#[derive(Clone)]
pub struct SandboxContext {
    pub config: Arc<SandboxConfig>,
    pub engine: Arc<dyn GuestEngine>,
    pub resolver: Arc<PackageResolver>,
    pub policy: CapabilityPolicy,
    pub bridge: HostBridge,
}

impl SandboxContext {
    pub fn new(
        config: SandboxConfig,
        engine: Arc<dyn GuestEngine>,
        resolver: Arc<PackageResolver>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            resolver,
            policy: CapabilityPolicy::standard(),
            bridge: HostBridge::Disabled,
        }
    }

    pub fn with_policy(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_bridge(mut self, bridge: HostBridge) -> Self {
        self.bridge = bridge;
        self
    }
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("engine", &self.engine.name())
            .field("rules", &self.policy.rules.len())
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a runtime. There is no way back to `Uninitialized` once
/// `Ready`; a failed setup returns there and may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimePhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// One entry of a mounted directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Host-side backing of the guest's private directories.
#[derive(Debug)]
struct Workspace {
    _root: TempDir,
    runtime_dir: PathBuf,
    tmp_dir: PathBuf,
    site_packages: PathBuf,
    interpreter: String,
}

impl Workspace {
    fn create(session_id: &str, policy: &CapabilityPolicy) -> SandboxResult<Self> {
        let root = tempfile::Builder::new()
            .prefix(&format!("pysandbox-{session_id}-"))
            .tempdir()?;
        let runtime_dir = root.path().join("runtime");
        let tmp_dir = root.path().join("tmp");
        let site_packages = root.path().join("site-packages");
        for dir in [&runtime_dir, &tmp_dir, &site_packages] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(runtime_dir.join(DRIVER_FILE), DRIVER_SOURCE)?;
        std::fs::write(runtime_dir.join(POLICY_FILE), policy.to_json()?)?;

        Ok(Self {
            _root: root,
            runtime_dir,
            tmp_dir,
            site_packages,
            interpreter: String::new(),
        })
    }

    fn preopens(&self) -> Vec<Preopen> {
        vec![
            Preopen::read_only(&self.runtime_dir, RUNTIME_GUEST_DIR),
            Preopen::read_write(&self.tmp_dir, TMP_GUEST_DIR),
            Preopen::read_write(&self.site_packages, SITE_PACKAGES_GUEST_DIR),
        ]
    }

    fn session_paths(&self) -> SessionPaths {
        SessionPaths {
            site_packages: self.site_packages.clone(),
            wheels: self.tmp_dir.join("wheels"),
        }
    }
}

/// Clears the `initializing` flag when setup finishes or its future is dropped.
struct SetupInProgress<'a>(&'a AtomicBool);

impl<'a> SetupInProgress<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SetupInProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The interpreter state for a single session.
pub struct SandboxRuntime {
    session_id: String,
    context: SandboxContext,
    init_gate: tokio::sync::Mutex<()>,
    initializing: AtomicBool,
    workspace: RwLock<Option<Arc<Workspace>>>,
    mount: RwLock<Option<MountPoint>>,
    setup_runs: AtomicU32,
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase())
            .field("mount", &self.mount_point())
            .finish_non_exhaustive()
    }
}

impl SandboxRuntime {
    pub fn new(session_id: impl Into<String>, context: SandboxContext) -> Self {
        Self {
            session_id: session_id.into(),
            context,
            init_gate: tokio::sync::Mutex::new(()),
            initializing: AtomicBool::new(false),
            workspace: RwLock::new(None),
            mount: RwLock::new(None),
            setup_runs: AtomicU32::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.context.config
    }

    pub fn phase(&self) -> RuntimePhase {
        if self.workspace().is_some() {
            RuntimePhase::Ready
        } else if self.initializing.load(Ordering::SeqCst) {
            RuntimePhase::Initializing
        } else {
            RuntimePhase::Uninitialized
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == RuntimePhase::Ready
    }

    /// Number of completed setup passes; stays at 1 however often
    /// [`initialize`](Self::initialize) is called.
    pub fn setup_count(&self) -> u32 {
        self.setup_runs.load(Ordering::SeqCst)
    }

    /// Interpreter version reported by the startup probe.
    pub fn interpreter_version(&self) -> Option<String> {
        self.workspace().map(|w| w.interpreter.clone())
    }

    pub fn mount_point(&self) -> Option<MountPoint> {
        self.mount
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn workspace(&self) -> Option<Arc<Workspace>> {
        self.workspace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bring the runtime to `Ready`. Idempotent; returns `false` on failure
    /// and leaves the runtime safe to retry.
    pub async fn initialize(&self, package_cache_dir: &Path) -> bool {
        let _gate = self.init_gate.lock().await;
        if self.is_ready() {
            info!(session_id = %self.session_id, "runtime already initialized");
            return true;
        }

        let started = Instant::now();
        let result = {
            let _in_progress = SetupInProgress::enter(&self.initializing);
            self.setup(package_cache_dir).await
        };

        match result {
            Ok(workspace) => {
                *self.workspace.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::new(workspace));
                self.setup_runs.fetch_add(1, Ordering::SeqCst);
                obs::emit_runtime_initialized(&self.session_id, started.elapsed().as_millis() as u64);
                true
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "runtime initialization failed");
                false
            }
        }
    }

    async fn setup(&self, package_cache_dir: &Path) -> SandboxResult<Workspace> {
        tokio::fs::create_dir_all(package_cache_dir).await?;
        let mut workspace = Workspace::create(&self.session_id, &self.context.policy)?;

        let invocation = GuestInvocation {
            request: GuestRequest::Probe,
            preopens: workspace.preopens(),
            env: self.context.bridge.guest_env(),
            limits: GuestLimits {
                memory_bytes: self.context.config.heap_limit_bytes,
                deadline: PROBE_DEADLINE,
            },
            cancel: CancelFlag::new(),
        };
        let outcome = self.context.engine.run(invocation).await?;
        let run = CapturedRun::parse(&outcome);
        let envelope = run.envelope.ok_or_else(|| {
            SandboxError::InitializationFailed(format!(
                "probe produced no result (exit code {}): {}",
                outcome.exit_code,
                String::from_utf8_lossy(&outcome.stderr).trim()
            ))
        })?;
        if !envelope.success {
            return Err(SandboxError::InitializationFailed(
                envelope.error.unwrap_or_else(|| "probe failed".to_string()),
            ));
        }

        let applied = envelope
            .info
            .as_ref()
            .and_then(|info| info.get("rules"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let expected = self.context.policy.rules.len();
        if applied != expected {
            return Err(SandboxError::InitializationFailed(format!(
                "capability policy applied {applied} of {expected} rules"
            )));
        }

        workspace.interpreter = envelope.value.unwrap_or_default();
        debug!(
            session_id = %self.session_id,
            interpreter = %workspace.interpreter,
            bridge = %self.context.bridge,
            rules = expected,
            "capability policy applied"
        );
        Ok(workspace)
    }

    /// Validate and bind `{data_dir}/{session_id}` at `{sandbox_base}/{session_id}`.
    ///
    /// Rejections are logged and reported as `false`; nothing is created for a
    /// path that fails the literal checks.
    pub fn mount(&self) -> bool {
        if self.mount_point().is_some() {
            return true;
        }

        let host_path = self.context.config.host_path_for(&self.session_id);
        match self.bind_mount(&host_path) {
            Ok(mount) => {
                info!(
                    session_id = %self.session_id,
                    host_path = %mount.host_path.display(),
                    sandbox_path = %mount.sandbox_path,
                    "session directory mounted"
                );
                *self.mount.write().unwrap_or_else(PoisonError::into_inner) = Some(mount);
                true
            }
            Err(e) => {
                METRICS.inc_mounts_rejected();
                obs::emit_mount_rejected(&self.session_id, &host_path.display(), &e.to_string());
                false
            }
        }
    }

    fn bind_mount(&self, host_path: &Path) -> SandboxResult<MountPoint> {
        let config = &self.context.config;
        let guard = MountGuard::new(&config.data_dir);
        let mount = guard.prepare(
            &self.session_id,
            host_path,
            config.sandbox_path_for(&self.session_id),
        )?;
        Ok(mount)
    }

    /// Refuse scripts that name the fallback installer before anything else
    /// (package resolution included) acts on them.
    pub fn precheck(&self, code: &str) -> SandboxResult<()> {
        if let Some(token) = find_installer_token(code) {
            METRICS.inc_policy_violations();
            warn!(session_id = %self.session_id, token = token, "installer use rejected");
            return Err(SandboxError::PolicyViolation {
                reason: INSTALL_DISABLED.to_string(),
            });
        }
        Ok(())
    }

    /// Run `code` with a fresh cancellation flag.
    pub async fn execute_script(&self, code: &str, timeout_ms: u64) -> ExecutionResult {
        self.execute_cancellable(code, timeout_ms, CancelFlag::new())
            .await
    }

    /// Run `code` under output capture, racing a `timeout_ms` timer.
    ///
    /// `cancel` lets an owning worker stop the guest after it stops waiting.
    pub async fn execute_cancellable(
        &self,
        code: &str,
        timeout_ms: u64,
        cancel: CancelFlag,
    ) -> ExecutionResult {
        let Some(workspace) = self.workspace() else {
            return SandboxError::NotInitialized("Sandbox runtime").into();
        };
        if let Err(e) = self.precheck(code) {
            return e.into();
        }

        let mount = self.mount_point();
        let mut preopens = workspace.preopens();
        if let Some(mount) = &mount {
            preopens.push(Preopen::read_write(&mount.host_path, &mount.sandbox_path));
        }
        let limit = self.context.config.max_output_bytes;
        let invocation = GuestInvocation {
            request: GuestRequest::Execute {
                code: code.to_string(),
                workdir: mount.map(|m| m.sandbox_path),
                reset_globals: true,
                max_output_bytes: limit,
            },
            preopens,
            env: self.context.bridge.guest_env(),
            limits: GuestLimits {
                memory_bytes: self.context.config.heap_limit_bytes,
                deadline: Duration::from_millis(timeout_ms),
            },
            cancel: cancel.clone(),
        };

        let raced = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.context.engine.run(invocation),
        )
        .await;

        let result: ExecutionResult = match raced {
            Err(_) => {
                cancel.cancel();
                SandboxError::Timeout { limit_ms: timeout_ms }.into()
            }
            Ok(Err(GuestError::DeadlineExceeded { .. })) | Ok(Err(GuestError::Cancelled)) => {
                SandboxError::Timeout { limit_ms: timeout_ms }.into()
            }
            Ok(Err(e)) => SandboxError::Guest(e).into(),
            Ok(Ok(outcome)) => CapturedRun::parse(&outcome).into_result(outcome.exit_code, limit),
        };

        if !result.success
            && (result.error.contains(NETWORK_DISABLED) || result.error.contains(INSTALL_DISABLED))
        {
            METRICS.inc_policy_violations();
        }
        result
    }

    /// Install every allow-listed package `code` imports.
    pub async fn install_packages(&self, code: &str) -> SandboxResult<InstallOutcome> {
        let workspace = self
            .workspace()
            .ok_or(SandboxError::NotInitialized("Sandbox runtime"))?;
        let installer = GuestWheelInstaller {
            context: &self.context,
            workspace: &workspace,
        };
        Ok(self
            .context
            .resolver
            .install_packages(code, &workspace.session_paths(), &installer)
            .await)
    }

    /// Install a single allow-listed package by import name.
    pub async fn install_package(&self, name: &str) -> SandboxResult<InstallOutcome> {
        if !self.context.config.allowed_packages.contains(name) {
            return Err(SandboxError::PackageResolution {
                package: name.to_string(),
                source: PackageError::NotAllowed(name.to_string()),
            });
        }
        self.install_packages(&format!("import {name}\n")).await
    }

    /// Entries of the mounted session directory, directories first.
    pub fn list_mounted_directory(&self) -> SandboxResult<Vec<MountEntry>> {
        let sandbox_path = self.context.config.sandbox_path_for(&self.session_id);
        let mount = self
            .mount_point()
            .ok_or_else(|| SandboxError::MountPointAbsent(sandbox_path.clone()))?;
        if !mount.host_path.is_dir() {
            return Err(SandboxError::MountPointAbsent(sandbox_path));
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&mount.host_path)? {
            let entry = entry?;
            entries.push(MountEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }
}

/// Installs wheels by running the guest in install mode.
struct GuestWheelInstaller<'a> {
    context: &'a SandboxContext,
    workspace: &'a Workspace,
}

#[async_trait]
impl WheelInstaller for GuestWheelInstaller<'_> {
    async fn prepare(&self) -> Result<(), PackageError> {
        let path = self
            .workspace
            .runtime_dir
            .join(format!("{INSTALLER_MODULE}.py"));
        tokio::fs::write(&path, INSTALLER_SOURCE).await?;
        Ok(())
    }

    async fn install(&self, package: &str, wheel: &str) -> Result<Vec<String>, PackageError> {
        let invocation = GuestInvocation {
            request: GuestRequest::Install {
                wheel: wheel.to_string(),
                target: SITE_PACKAGES_GUEST_DIR.to_string(),
            },
            preopens: self.workspace.preopens(),
            env: self.context.bridge.guest_env(),
            limits: GuestLimits {
                memory_bytes: self.context.config.heap_limit_bytes,
                deadline: INSTALL_DEADLINE,
            },
            cancel: CancelFlag::new(),
        };
        let install_error = |reason: String| PackageError::Install {
            package: package.to_string(),
            reason,
        };

        let outcome = self
            .context
            .engine
            .run(invocation)
            .await
            .map_err(|e| install_error(e.to_string()))?;
        let result = CapturedRun::parse(&outcome).into_result(outcome.exit_code, 0);
        if !result.success {
            return Err(install_error(result.error));
        }
        Ok(result
            .value
            .split(", ")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_layout() {
        let ws = Workspace::create("s1", &CapabilityPolicy::standard()).unwrap();
        assert!(ws.runtime_dir.join(DRIVER_FILE).is_file());
        let policy = std::fs::read_to_string(ws.runtime_dir.join(POLICY_FILE)).unwrap();
        assert!(policy.contains("deny_call"));

        let guests: Vec<_> = ws.preopens().into_iter().map(|p| (p.guest, p.writable)).collect();
        assert_eq!(
            guests,
            vec![
                (RUNTIME_GUEST_DIR.to_string(), false),
                (TMP_GUEST_DIR.to_string(), true),
                (SITE_PACKAGES_GUEST_DIR.to_string(), true),
            ]
        );
        assert_eq!(ws.session_paths().wheels, ws.tmp_dir.join("wheels"));
    }
}
