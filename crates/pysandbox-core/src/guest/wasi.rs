//! `WasiPythonEngine`: CPython compiled for WASI, run in-process by wasmtime.
//!
//! WASI preopened directories are the whole guest filesystem: the guest cannot
//! name a host path it was not handed. Each invocation gets a fresh `Store`
//! with a linear-memory ceiling; an epoch ticker lets the store check its
//! cancellation flag and deadline every few milliseconds, so a runaway script
//! is trapped rather than left spinning.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, UpdateDeadline,
};
use wasmtime_wasi::{
    p2::pipe::{MemoryInputPipe, MemoryOutputPipe},
    p2::WasiCtxBuilder,
    preview1::{add_to_linker_sync, WasiP1Ctx},
    DirPerms, FilePerms, I32Exit,
};

use super::{
    CancelFlag, GuestEngine, GuestError, GuestInvocation, GuestOutcome, Preopen, DRIVER_FILE,
    RUNTIME_GUEST_DIR,
};
use crate::config::SandboxConfig;

/// How often the engine epoch advances.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Maximum bytes kept from each guest stream.
const MAX_STREAM_BYTES: usize = 16 * 1024 * 1024;

/// Store data combining the WASI context and resource limiter.
struct StoreData {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Background thread advancing the engine epoch until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        std::thread::Builder::new()
            .name("pysandbox-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Cancels the invocation if the awaiting future is dropped mid-run.
struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.cancel();
        }
    }
}

/// Production [`GuestEngine`] backed by a compiled `python.wasm`.
pub struct WasiPythonEngine {
    engine: Engine,
    module: Module,
    stdlib: Preopen,
    _ticker: EpochTicker,
}

impl std::fmt::Debug for WasiPythonEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasiPythonEngine")
            .field("stdlib", &self.stdlib)
            .finish_non_exhaustive()
    }
}

impl WasiPythonEngine {
    /// Compile the interpreter once. Expensive; share the result across sessions.
    pub fn load(
        python_wasm: &Path,
        stdlib_dir: &Path,
        stdlib_guest_path: &str,
    ) -> Result<Self, GuestError> {
        if !python_wasm.is_file() {
            return Err(GuestError::Unavailable(format!(
                "interpreter module not found at {}",
                python_wasm.display()
            )));
        }
        if !stdlib_dir.is_dir() {
            return Err(GuestError::Unavailable(format!(
                "standard library not found at {}",
                stdlib_dir.display()
            )));
        }

        let mut config = Config::new();
        config.epoch_interruption(true);
        config.max_wasm_stack(8 << 20);

        let engine = Engine::new(&config)
            .map_err(|e| GuestError::Unavailable(format!("failed to create engine: {e}")))?;

        let started = Instant::now();
        let module = Module::from_file(&engine, python_wasm)
            .map_err(|e| GuestError::Unavailable(format!("failed to compile interpreter: {e}")))?;
        info!(
            module = %python_wasm.display(),
            compile_ms = started.elapsed().as_millis() as u64,
            "interpreter module compiled"
        );

        let ticker = EpochTicker::start(engine.clone())
            .map_err(|e| GuestError::Unavailable(format!("failed to start epoch ticker: {e}")))?;

        Ok(Self {
            engine,
            module,
            stdlib: Preopen::read_only(stdlib_dir, stdlib_guest_path),
            _ticker: ticker,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, GuestError> {
        Self::load(
            &config.python_wasm,
            &config.stdlib_dir,
            &config.stdlib_guest_path,
        )
    }
}

#[async_trait]
impl GuestEngine for WasiPythonEngine {
    async fn run(&self, invocation: GuestInvocation) -> Result<GuestOutcome, GuestError> {
        let engine = self.engine.clone();
        let module = self.module.clone();
        let stdlib = self.stdlib.clone();
        let mut guard = CancelOnDrop(Some(invocation.cancel.clone()));

        // wasmtime-wasi's sync linker drives WASI I/O on its own runtime,
        // so the guest must not run on a tokio worker thread.
        let result = tokio::task::spawn_blocking(move || {
            run_guest_sync(&engine, &module, &stdlib, invocation)
        })
        .await
        .map_err(|e| GuestError::Worker(e.to_string()));

        match result {
            Ok(outcome) => {
                guard.disarm();
                outcome
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        "wasi-python"
    }
}

/// Execute the interpreter synchronously on the current (blocking) thread.
fn run_guest_sync(
    engine: &Engine,
    module: &Module,
    stdlib: &Preopen,
    invocation: GuestInvocation,
) -> Result<GuestOutcome, GuestError> {
    let started = Instant::now();
    let deadline = started + invocation.limits.deadline;
    let limit_ms = invocation.limits.deadline.as_millis() as u64;
    let mode = invocation.request.mode();

    let input = serde_json::to_vec(&invocation.request)
        .map_err(|e| GuestError::Setup(format!("failed to encode request: {e}")))?;

    let driver = format!("{RUNTIME_GUEST_DIR}/{DRIVER_FILE}");
    let mut builder = WasiCtxBuilder::new();
    builder.args(&["python", "-I", "-B", driver.as_str()]);
    for (key, value) in &invocation.env {
        builder.env(key, value);
    }
    preopen(&mut builder, stdlib)?;
    for dir in &invocation.preopens {
        preopen(&mut builder, dir)?;
    }

    let stdout = MemoryOutputPipe::new(MAX_STREAM_BYTES);
    let stderr = MemoryOutputPipe::new(MAX_STREAM_BYTES);
    builder
        .stdin(MemoryInputPipe::new(input))
        .stdout(stdout.clone())
        .stderr(stderr.clone());
    let wasi = builder.build_p1();

    let limits = StoreLimitsBuilder::new()
        .memory_size(usize::try_from(invocation.limits.memory_bytes).unwrap_or(usize::MAX))
        .instances(1)
        .build();

    let mut store = Store::new(engine, StoreData { wasi, limits });
    store.limiter(|data| &mut data.limits);

    let cancel = invocation.cancel.clone();
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(move |_ctx| {
        if cancel.is_cancelled() {
            anyhow::bail!("guest cancelled");
        }
        if Instant::now() >= deadline {
            anyhow::bail!("guest deadline exceeded");
        }
        Ok(UpdateDeadline::Continue(1))
    });

    let mut linker: Linker<StoreData> = Linker::new(engine);
    add_to_linker_sync(&mut linker, |data| &mut data.wasi)
        .map_err(|e| GuestError::Setup(format!("failed to link WASI: {e}")))?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| GuestError::Setup(format!("failed to instantiate interpreter: {e}")))?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(|e| GuestError::Setup(format!("interpreter missing _start: {e}")))?;

    let exit_code = match start.call(&mut store, ()) {
        Ok(()) => 0,
        Err(err) => {
            if let Some(exit) = err.downcast_ref::<I32Exit>() {
                exit.0
            } else if invocation.cancel.is_cancelled() {
                return Err(GuestError::Cancelled);
            } else if Instant::now() >= deadline {
                return Err(GuestError::DeadlineExceeded { limit_ms });
            } else {
                let tail = String::from_utf8_lossy(&stderr.contents()).into_owned();
                return Err(GuestError::Trap(format!("{err:#}{}", stderr_suffix(&tail))));
            }
        }
    };

    debug!(
        mode = mode,
        exit_code = exit_code,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "guest invocation finished"
    );

    Ok(GuestOutcome {
        exit_code,
        stdout: stdout.contents().to_vec(),
        stderr: stderr.contents().to_vec(),
    })
}

fn preopen(builder: &mut WasiCtxBuilder, dir: &Preopen) -> Result<(), GuestError> {
    let (dir_perms, file_perms) = if dir.writable {
        (DirPerms::all(), FilePerms::all())
    } else {
        (DirPerms::READ, FilePerms::READ)
    };
    builder
        .preopened_dir(&dir.host, &dir.guest, dir_perms, file_perms)
        .map_err(|e| {
            GuestError::Setup(format!(
                "failed to preopen {} -> {}: {e}",
                dir.host.display(),
                dir.guest
            ))
        })?;
    Ok(())
}

fn stderr_suffix(stderr: &str) -> String {
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    if tail.is_empty() {
        String::new()
    } else {
        let lines: Vec<&str> = tail.into_iter().rev().collect();
        format!(" (stderr: {})", lines.join(" | "))
    }
}
