//! Structured observability hooks for sandbox lifecycle events.
//!
//! This module provides:
//! - Execution-scoped tracing spans via `ExecutionSpan`
//! - Emission functions for key lifecycle events: runtime initialized,
//!   execution started/finished/timed out, mount rejected, package attempts
//!
//! Events are emitted at `info!` level unless they describe a rejection.

use std::future::Future;

use tracing::instrument::Instrumented;
use tracing::{info, warn, Instrument};

/// Execution-scoped tracing span tagged with session and execution ids.
///
/// # Example
///
/// ```ignore
/// let span = ExecutionSpan::new("session-1", &execution_id);
/// span.instrument(async { /* events here carry both ids */ }).await;
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionSpan {
    span: tracing::Span,
}

impl ExecutionSpan {
    pub fn new(session_id: &str, execution_id: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "pysandbox.execution",
                session_id = %session_id,
                execution_id = %execution_id
            ),
        }
    }

    /// Enter the span for the current synchronous scope.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    /// Attach the span to a future so it follows it across await points.
    pub fn instrument<F: Future>(&self, fut: F) -> Instrumented<F> {
        fut.instrument(self.span.clone())
    }
}

/// Emit event: a session runtime finished initializing.
pub fn emit_runtime_initialized(session_id: &str, duration_ms: u64) {
    info!(event = "runtime.initialized", session_id = %session_id, duration_ms = duration_ms);
}

/// Emit event: execution submitted to a worker.
pub fn emit_execution_started(session_id: &str, timeout_ms: u64, code_len: usize) {
    info!(
        event = "execution.started",
        session_id = %session_id,
        timeout_ms = timeout_ms,
        code_len = code_len,
    );
}

/// Emit event: execution settled with a result.
pub fn emit_execution_finished(session_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "execution.finished",
        session_id = %session_id,
        duration_ms = duration_ms,
        success = success,
    );
}

/// Emit event: the wall-clock budget elapsed before the worker answered.
pub fn emit_execution_timed_out(session_id: &str, limit_ms: u64) {
    warn!(event = "execution.timed_out", session_id = %session_id, limit_ms = limit_ms);
}

/// Emit event: a mount request failed validation (warning level).
pub fn emit_mount_rejected(session_id: &str, path: &dyn std::fmt::Display, reason: &str) {
    warn!(
        event = "mount.rejected",
        session_id = %session_id,
        path = %path,
        reason = %reason,
    );
}

/// Emit event: one package install attempt settled.
pub fn emit_package_attempt(package: &str, strategy: &str, success: bool) {
    info!(
        event = "package.attempt",
        package = %package,
        strategy = %strategy,
        success = success,
    );
}

#[cfg(test)]
mod tests {
    use super::{emit_execution_finished, emit_execution_started, ExecutionSpan};

    #[test]
    fn test_execution_span_create() {
        let span = ExecutionSpan::new("session", "exec-1");
        let _entered = span.enter();
        emit_execution_started("session", 1000, 3);
        emit_execution_finished("session", 12, true);
    }

    #[tokio::test]
    async fn test_execution_span_instruments_future() {
        let span = ExecutionSpan::new("session", "exec-2");
        let value = span.instrument(async { 7 }).await;
        assert_eq!(value, 7);
    }
}
