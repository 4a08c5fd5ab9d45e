//! `WorkerExecutor`: one isolated task per execution, raced against a timer.
//!
//! Each call spawns a fresh worker task that resolves the session runtime,
//! refuses installer use, mounts the session directory, installs imported
//! packages, and runs the script. The caller waits on a oneshot channel and a sleep; whichever wins,
//! a teardown guard cancels the guest and aborts the task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use super::request::{ExecutionRequest, ExecutionResult};
use crate::error::{SandboxError, SandboxResult};
use crate::guest::CancelFlag;
use crate::metrics::METRICS;
use crate::obs::{self, ExecutionSpan};

/// What a worker reports back before exiting.
#[derive(Debug)]
enum WorkerMessage {
    Response(ExecutionResult),
    Fatal(SandboxError),
}

/// Cancels the guest and aborts the worker task when dropped.
struct Teardown {
    cancel: CancelFlag,
    handle: AbortHandle,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// Decrements the live-worker count when the worker task ends, aborted or not.
struct LiveWorker(Arc<AtomicUsize>);

impl LiveWorker {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerExecutor {
    registry: Arc<SessionRegistry>,
    live: Arc<AtomicUsize>,
}

impl WorkerExecutor {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Worker tasks that have not yet been torn down.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        self.run_code(&request.session_id, &request.code, request.timeout_ms)
            .await
    }

    /// Execute `code` for `session_id` within `timeout_ms`.
    pub async fn run_code(&self, session_id: &str, code: &str, timeout_ms: u64) -> ExecutionResult {
        if timeout_ms == 0 {
            return ExecutionResult::failure("timeout must be a positive number of milliseconds");
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let span = ExecutionSpan::new(session_id, &execution_id);
        span.instrument(self.race(span.clone(), session_id, code, timeout_ms))
            .await
    }

    async fn race(
        &self,
        span: ExecutionSpan,
        session_id: &str,
        code: &str,
        timeout_ms: u64,
    ) -> ExecutionResult {
        obs::emit_execution_started(session_id, timeout_ms, code.len());
        METRICS.inc_executions();
        let started = Instant::now();

        let (tx, rx) = oneshot::channel();
        let cancel = CancelFlag::new();
        let handle = tokio::spawn(span.instrument(worker(
            Arc::clone(&self.registry),
            LiveWorker::enter(&self.live),
            session_id.to_string(),
            code.to_string(),
            timeout_ms,
            cancel.clone(),
            tx,
        )));
        let teardown = Teardown {
            cancel,
            handle: handle.abort_handle(),
        };

        let result = tokio::select! {
            message = rx => match message {
                Ok(WorkerMessage::Response(result)) => result,
                Ok(WorkerMessage::Fatal(e)) => e.into(),
                Err(_) => SandboxError::Transport(
                    "worker exited without a response".to_string(),
                )
                .into(),
            },
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                METRICS.inc_timeouts();
                obs::emit_execution_timed_out(session_id, timeout_ms);
                SandboxError::Timeout { limit_ms: timeout_ms }.into()
            }
        };
        drop(teardown);

        obs::emit_execution_finished(
            session_id,
            started.elapsed().as_millis() as u64,
            result.success,
        );
        result
    }
}

async fn worker(
    registry: Arc<SessionRegistry>,
    _live: LiveWorker,
    session_id: String,
    code: String,
    timeout_ms: u64,
    cancel: CancelFlag,
    tx: oneshot::Sender<WorkerMessage>,
) {
    let message = match execute(&registry, &session_id, &code, timeout_ms, cancel).await {
        Ok(result) => WorkerMessage::Response(result),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "worker failed");
            WorkerMessage::Fatal(e)
        }
    };
    if tx.send(message).is_err() {
        debug!(session_id = %session_id, "caller stopped waiting before the worker finished");
    }
}

async fn execute(
    registry: &SessionRegistry,
    session_id: &str,
    code: &str,
    timeout_ms: u64,
    cancel: CancelFlag,
) -> SandboxResult<ExecutionResult> {
    let started = Instant::now();
    let runtime = registry.get_initialized(session_id).await?;
    if let Err(e) = runtime.precheck(code) {
        return Ok(e.into());
    }

    if !runtime.mount() {
        warn!(session_id = %session_id, "continuing without a session mount");
    }

    let outcome = runtime.install_packages(code).await?;

    let remaining = timeout_ms.saturating_sub(started.elapsed().as_millis() as u64);
    if remaining == 0 {
        return Err(SandboxError::Timeout { limit_ms: timeout_ms });
    }
    let result = runtime.execute_cancellable(code, remaining, cancel).await;
    Ok(result.with_install_log(outcome.lines()))
}
