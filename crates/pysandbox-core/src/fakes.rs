//! In-memory fakes for the sandbox seams (testing only)
//!
//! Provides `ScriptedGuest`, `StaticPackageIndex`, and `RecordingInstaller`
//! that satisfy the trait contracts without a compiled interpreter or network.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::guest::{
    GuestEngine, GuestError, GuestInvocation, GuestOutcome, GuestRequest, Preopen, POLICY_FILE,
    RUNTIME_GUEST_DIR, SITE_PACKAGES_GUEST_DIR,
};
use crate::packages::{PackageError, PackageIndex, WheelInstaller, WheelRelease};
use crate::sandbox::capture::GuestEnvelope;
use crate::sandbox::CapabilityPolicy;

// ---------------------------------------------------------------------------
// ScriptedGuest
// ---------------------------------------------------------------------------

/// What a [`ScriptedGuest`] does with an `execute` request.
#[derive(Debug, Clone)]
pub enum GuestReply {
    /// Print this envelope as the driver would.
    Envelope(GuestEnvelope),
    /// Return raw streams with no envelope.
    Raw(GuestOutcome),
    /// Fail the invocation outright.
    Fail(String),
    /// Spin until cancelled or past the deadline, like `while True: pass`.
    Hang,
}

type ExecHandler = dyn Fn(&str, &GuestInvocation) -> GuestReply + Send + Sync;

/// A [`GuestEngine`] that answers probes and installs the way the real driver
/// does and delegates `execute` to a closure.
///
/// Probes read `policy.json` from the `/.runtime` preopen and report its rule
/// count; installs unpack nothing but create the package directory under the
/// `/site-packages` preopen.
pub struct ScriptedGuest {
    handler: Box<ExecHandler>,
    fail_probe: bool,
    probe_delay: Duration,
    invocations: Mutex<Vec<GuestInvocation>>,
    probes: AtomicUsize,
}

impl std::fmt::Debug for ScriptedGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGuest")
            .field("fail_probe", &self.fail_probe)
            .field("probes", &self.probe_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedGuest {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &GuestInvocation) -> GuestReply + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            fail_probe: false,
            probe_delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
        }
    }

    /// Every script evaluates to `value` with no output.
    pub fn returning(value: &str) -> Self {
        let value = value.to_string();
        Self::new(move |_, _| GuestReply::Envelope(GuestEnvelope::ok(value.clone())))
    }

    /// Probes report failure, so initialization never succeeds.
    pub fn with_failing_probe(mut self) -> Self {
        self.fail_probe = true;
        self
    }

    /// Probes take at least `delay`, widening initialization races.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<GuestInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Invocations whose request was `mode`.
    pub fn count(&self, mode: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.request.mode() == mode)
            .count()
    }

    fn probe(&self, invocation: &GuestInvocation) -> GuestOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_probe {
            return envelope(GuestEnvelope::err("Fatal Python error: init_fs_encoding"));
        }
        let rules = host_dir(&invocation.preopens, RUNTIME_GUEST_DIR)
            .and_then(|dir| std::fs::read_to_string(dir.join(POLICY_FILE)).ok())
            .and_then(|json| serde_json::from_str::<CapabilityPolicy>(&json).ok())
            .map(|p| p.rules.len())
            .unwrap_or(0);
        let mut env = GuestEnvelope::ok("3.12.0");
        env.info = Some(serde_json::json!({"platform": "wasi", "rules": rules}));
        envelope(env)
    }

    fn install(&self, wheel: &str, invocation: &GuestInvocation) -> GuestOutcome {
        let Some(site) = host_dir(&invocation.preopens, SITE_PACKAGES_GUEST_DIR) else {
            return envelope(GuestEnvelope::err("FileNotFoundError: /site-packages"));
        };
        let filename = wheel.rsplit('/').next().unwrap_or(wheel);
        let top = filename.split('-').next().unwrap_or(filename).replace('-', "_");
        match std::fs::create_dir_all(site.join(&top)) {
            Ok(()) => envelope(GuestEnvelope::ok(top)),
            Err(e) => envelope(GuestEnvelope::err(format!("OSError: {e}"))),
        }
    }
}

#[async_trait]
impl GuestEngine for ScriptedGuest {
    async fn run(&self, invocation: GuestInvocation) -> Result<GuestOutcome, GuestError> {
        self.invocations.lock().unwrap().push(invocation.clone());

        match &invocation.request {
            GuestRequest::Probe => {
                tokio::time::sleep(self.probe_delay).await;
                Ok(self.probe(&invocation))
            }
            GuestRequest::Install { wheel, .. } => Ok(self.install(wheel, &invocation)),
            GuestRequest::Execute { code, .. } => match (self.handler)(code, &invocation) {
                GuestReply::Envelope(env) => Ok(envelope(env)),
                GuestReply::Raw(outcome) => Ok(outcome),
                GuestReply::Fail(reason) => Err(GuestError::Trap(reason)),
                GuestReply::Hang => {
                    let deadline = Instant::now() + invocation.limits.deadline;
                    loop {
                        if invocation.cancel.is_cancelled() {
                            return Err(GuestError::Cancelled);
                        }
                        if Instant::now() >= deadline {
                            return Err(GuestError::DeadlineExceeded {
                                limit_ms: invocation.limits.deadline.as_millis() as u64,
                            });
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            },
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn envelope(env: GuestEnvelope) -> GuestOutcome {
    GuestOutcome {
        exit_code: 0,
        stdout: env.encode().into_bytes(),
        stderr: Vec::new(),
    }
}

/// Host directory preopened at `guest`, if any.
pub fn host_dir(preopens: &[Preopen], guest: &str) -> Option<PathBuf> {
    preopens
        .iter()
        .find(|p| p.guest == guest)
        .map(|p| p.host.clone())
}

// ---------------------------------------------------------------------------
// StaticPackageIndex
// ---------------------------------------------------------------------------

/// In-memory index serving one wheel per distribution.
#[derive(Debug, Default)]
pub struct StaticPackageIndex {
    wheels: HashMap<String, (WheelRelease, Vec<u8>)>,
    delays: HashMap<String, Duration>,
    downloads: Mutex<Vec<String>>,
}

impl StaticPackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `{distribution}-{version}-py3-none-any.whl` with a correct digest.
    pub fn with_wheel(mut self, distribution: &str, version: &str) -> Self {
        let filename = format!(
            "{}-{version}-py3-none-any.whl",
            distribution.replace('-', "_")
        );
        let data = format!("PK fake wheel {filename}").into_bytes();
        let release = WheelRelease {
            distribution: distribution.to_string(),
            version: version.to_string(),
            filename: filename.clone(),
            url: format!("https://files.example/{filename}"),
            sha256: Some(hex::encode(Sha256::digest(&data))),
        };
        self.wheels
            .insert(distribution.to_string(), (release, data));
        self
    }

    /// Delay lookups for `distribution`.
    pub fn with_delay(mut self, distribution: &str, delay: Duration) -> Self {
        self.delays.insert(distribution.to_string(), delay);
        self
    }

    /// Filenames downloaded so far, in order.
    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageIndex for StaticPackageIndex {
    async fn latest_wheel(&self, distribution: &str) -> Result<WheelRelease, PackageError> {
        if let Some(delay) = self.delays.get(distribution) {
            tokio::time::sleep(*delay).await;
        }
        self.wheels
            .get(distribution)
            .map(|(release, _)| release.clone())
            .ok_or_else(|| PackageError::NoPureWheel(distribution.to_string()))
    }

    async fn download(&self, release: &WheelRelease) -> Result<Vec<u8>, PackageError> {
        self.downloads.lock().unwrap().push(release.filename.clone());
        self.wheels
            .get(&release.distribution)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| PackageError::Index {
                package: release.distribution.clone(),
                reason: "not published".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// RecordingInstaller
// ---------------------------------------------------------------------------

/// [`WheelInstaller`] that records calls instead of running a guest.
#[derive(Debug, Default, Clone)]
pub struct RecordingInstaller {
    prepared: Arc<AtomicUsize>,
    installs: Arc<Mutex<Vec<(String, String)>>>,
    staged_seen: Arc<Mutex<Vec<String>>>,
    staging: Option<PathBuf>,
    failing: Vec<String>,
    unavailable: bool,
}

impl RecordingInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs of `package` fail.
    pub fn failing(mut self, package: &str) -> Self {
        self.failing.push(package.to_string());
        self
    }

    /// `prepare` fails, so every fallback install fails.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Check the host staging directory for each wheel as it is installed.
    pub fn with_staging(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging = Some(dir.into());
        self
    }

    /// Wheel filenames found staged on the host when their install ran.
    pub fn staged_at_install(&self) -> Vec<String> {
        self.staged_seen.lock().unwrap().clone()
    }

    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    /// `(package, guest wheel path)` pairs in install order.
    pub fn installs(&self) -> Vec<(String, String)> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl WheelInstaller for RecordingInstaller {
    async fn prepare(&self) -> Result<(), PackageError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(PackageError::Install {
                package: "installer".to_string(),
                reason: "module failed to load".to_string(),
            });
        }
        Ok(())
    }

    async fn install(&self, package: &str, wheel: &str) -> Result<Vec<String>, PackageError> {
        self.installs
            .lock()
            .unwrap()
            .push((package.to_string(), wheel.to_string()));
        let filename = wheel.rsplit('/').next().unwrap_or(wheel);
        if let Some(dir) = &self.staging {
            if dir.join(filename).is_file() {
                self.staged_seen.lock().unwrap().push(filename.to_string());
            }
        }
        if self.failing.iter().any(|p| p == package) {
            return Err(PackageError::Install {
                package: package.to_string(),
                reason: "BadZipFile: File is not a zip file".to_string(),
            });
        }
        Ok(vec![package.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::{CancelFlag, GuestLimits};

    fn invocation(request: GuestRequest) -> GuestInvocation {
        GuestInvocation {
            request,
            preopens: Vec::new(),
            env: Vec::new(),
            limits: GuestLimits {
                memory_bytes: 1 << 20,
                deadline: Duration::from_millis(50),
            },
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn test_hang_honours_cancel() {
        let guest = ScriptedGuest::new(|_, _| GuestReply::Hang);
        let inv = invocation(GuestRequest::Execute {
            code: "while True: pass".into(),
            workdir: None,
            reset_globals: true,
            max_output_bytes: 0,
        });
        inv.cancel.cancel();
        assert!(matches!(guest.run(inv).await, Err(GuestError::Cancelled)));
        assert_eq!(guest.count("execute"), 1);
    }

    #[tokio::test]
    async fn test_static_index_serves_verified_wheels() {
        let index = StaticPackageIndex::new().with_wheel("python-dateutil", "2.9.0");
        let release = index.latest_wheel("python-dateutil").await.unwrap();
        assert_eq!(release.filename, "python_dateutil-2.9.0-py3-none-any.whl");
        let data = index.download(&release).await.unwrap();
        assert_eq!(
            release.sha256.unwrap(),
            hex::encode(Sha256::digest(&data))
        );
        assert!(index.latest_wheel("numpy").await.is_err());
    }
}
