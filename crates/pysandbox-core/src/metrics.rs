//! Global atomic counters for sandbox observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters with no allocations, no locking.
pub struct Metrics {
    executions_started: AtomicU64,
    executions_timed_out: AtomicU64,
    policy_violations: AtomicU64,
    packages_installed: AtomicU64,
    package_failures: AtomicU64,
    mounts_rejected: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            policy_violations: AtomicU64::new(0),
            packages_installed: AtomicU64::new(0),
            package_failures: AtomicU64::new(0),
            mounts_rejected: AtomicU64::new(0),
        }
    }

    pub fn inc_executions(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_started", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_timed_out", "counter incremented");
    }

    pub fn inc_policy_violations(&self) {
        self.policy_violations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "policy_violations", "counter incremented");
    }

    pub fn inc_packages_installed(&self) {
        self.packages_installed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "packages_installed", "counter incremented");
    }

    pub fn inc_package_failures(&self) {
        self.package_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "package_failures", "counter incremented");
    }

    pub fn inc_mounts_rejected(&self) {
        self.mounts_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "mounts_rejected", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions_started = self.executions_started(),
            executions_timed_out = self.executions_timed_out(),
            policy_violations = self.policy_violations(),
            packages_installed = self.packages_installed(),
            package_failures = self.package_failures(),
            mounts_rejected = self.mounts_rejected(),
        );
    }

    pub fn executions_started(&self) -> u64 {
        self.executions_started.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn policy_violations(&self) -> u64 {
        self.policy_violations.load(Ordering::Relaxed)
    }

    pub fn packages_installed(&self) -> u64 {
        self.packages_installed.load(Ordering::Relaxed)
    }

    pub fn package_failures(&self) -> u64 {
        self.package_failures.load(Ordering::Relaxed)
    }

    pub fn mounts_rejected(&self) -> u64 {
        self.mounts_rejected.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.executions_started.store(0, Ordering::Relaxed);
        self.executions_timed_out.store(0, Ordering::Relaxed);
        self.policy_violations.store(0, Ordering::Relaxed);
        self.packages_installed.store(0, Ordering::Relaxed);
        self.package_failures.store(0, Ordering::Relaxed);
        self.mounts_rejected.store(0, Ordering::Relaxed);
    }
}
