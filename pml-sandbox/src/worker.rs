//! Sandbox worker lifecycle: each worker is a fresh, isolated
//! WebAssembly instance with WASI configured for zero ambient authority — no
//! filesystem preopens, no sockets, no inherited environment or args. The
//! only way sandboxed code reaches the host is the single imported
//! `pml::rpc_call` function, which is wired to an [`RpcBridge`].
//!
//! Guest ABI (documented here because it has no other home): a module must
//! export `memory`, `alloc(len: i32) -> i32`, and
//! `execute(args_ptr: i32, args_len: i32) -> i64` returning a packed
//! `(ptr << 32) | len` pointing at a UTF-8 JSON result buffer it allocated.
//! Tool calls go out through the imported `pml::rpc_call(method_ptr,
//! method_len, args_ptr, args_len) -> i64`, packed the same way, pointing at
//! a `{"ok": ...}` or `{"err": ...}` JSON envelope the guest allocated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Linker, Memory, Module, Store, TypedFunc};
use wasmtime_wasi::{WasiCtxBuilder, p1::WasiP1Ctx};

use crate::bridge::{DEFAULT_EXECUTION_TIMEOUT, RpcBridge};
use crate::protocol::{SandboxErrorCode, SandboxResult};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker is already running an execution")]
    Busy,
    #[error("failed to compile sandboxed module: {0}")]
    Compile(String),
    #[error("failed to instantiate sandboxed module: {0}")]
    Instantiate(String),
    #[error("sandboxed module is missing a required export: {0}")]
    MissingExport(&'static str),
}

struct HostState {
    wasi: WasiP1Ctx,
    bridge: RpcBridge,
}

/// A single-use-at-a-time WASM sandbox. Construction compiles nothing;
/// compilation happens per-execution from caller-supplied bytecode, since a
/// worker is reused across calls within one `call` chain but each call
/// may run a different capability's code.
pub struct SandboxWorker {
    engine: Engine,
    busy: std::sync::atomic::AtomicBool,
}

impl SandboxWorker {
    pub fn new() -> Self {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).expect("wasmtime engine config is valid");
        Self {
            engine,
            busy: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Run `code` with `args`, routing any tool calls through `bridge`.
    /// Serial per worker: a second concurrent call on the same worker
    /// returns [`WorkerError::Busy`] rather than interleaving executions.
    pub async fn execute(
        &self,
        code: Vec<u8>,
        args: Value,
        bridge: RpcBridge,
        timeout: Duration,
    ) -> Result<SandboxResult, WorkerError> {
        if self
            .busy
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(WorkerError::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        let engine = self.engine.clone();
        let started = Instant::now();

        let deadline_engine = engine.clone();
        let deadline_handle = tokio::spawn(async move {
            let ticks = (timeout.as_millis() / 50).max(1) as u64;
            for _ in 0..ticks {
                tokio::time::sleep(Duration::from_millis(50)).await;
                deadline_engine.increment_epoch();
            }
        });

        let run = tokio::task::spawn_blocking(move || {
            run_module(&engine, code, args, bridge, timeout)
        });

        let outcome = tokio::time::timeout(timeout + Duration::from_secs(1), run).await;
        deadline_handle.abort();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(Ok(value))) => Ok(SandboxResult::Success {
                value,
                duration_ms: elapsed_ms,
            }),
            Ok(Ok(Err(classified))) => Ok(classified.into_result(elapsed_ms)),
            Ok(Err(_join_panic)) => {
                warn!("sandbox worker thread panicked");
                Ok(SandboxResult::failure(
                    SandboxErrorCode::WorkerTerminated,
                    "sandbox worker terminated unexpectedly",
                    elapsed_ms,
                ))
            }
            Err(_elapsed) => Ok(SandboxResult::failure(
                SandboxErrorCode::ExecutionTimeout,
                "execution did not complete before the deadline",
                elapsed_ms,
            )),
        }
    }
}

impl Default for SandboxWorker {
    fn default() -> Self {
        Self::new()
    }
}

struct BusyGuard<'a>(&'a std::sync::atomic::AtomicBool);
impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Classified, user-code-attributable failure, as opposed to infra failures
/// (timeout, worker panic) handled by the caller.
enum ClassifiedError {
    Code(String),
    Permission(String),
}

impl ClassifiedError {
    fn into_result(self, duration_ms: u64) -> SandboxResult {
        match self {
            ClassifiedError::Code(message) => {
                SandboxResult::failure(SandboxErrorCode::CodeError, message, duration_ms)
            }
            ClassifiedError::Permission(message) => {
                SandboxResult::failure(SandboxErrorCode::PermissionDenied, message, duration_ms)
            }
        }
    }
}

/// Classify a wasmtime trap/error message into the sandbox error taxonomy.
/// Sandbox violations (WASI calls that were never linked, i.e. any attempt
/// to reach host facilities outside `pml::rpc_call`) surface as
/// `unknown import` traps from the linker and are reported as
/// `PERMISSION_DENIED`; everything else is a plain `CODE_ERROR`.
fn classify(message: &str) -> ClassifiedError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("unknown import") || lower.contains("unsatisfied import") {
        ClassifiedError::Permission(message.to_string())
    } else {
        ClassifiedError::Code(message.to_string())
    }
}

fn run_module(
    engine: &Engine,
    code: Vec<u8>,
    args: Value,
    bridge: RpcBridge,
    timeout: Duration,
) -> Result<Value, ClassifiedError> {
    let module = Module::new(engine, &code)
        .map_err(|e| ClassifiedError::Code(format!("failed to compile module: {e}")))?;

    let wasi = WasiCtxBuilder::new().build_p1();
    let mut store = Store::new(engine, HostState { wasi, bridge });
    store.set_epoch_deadline((timeout.as_millis() / 50).max(1) as u64);
    store.set_fuel(u64::MAX).ok();

    let mut linker: Linker<HostState> = Linker::new(engine);
    wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| {
        &mut state.wasi
    })
    .map_err(|e| ClassifiedError::Code(format!("failed to link wasi: {e}")))?;

    linker
        .func_wrap(
            "pml",
            "rpc_call",
            |mut caller: wasmtime::Caller<'_, HostState>,
             method_ptr: i32,
             method_len: i32,
             args_ptr: i32,
             args_len: i32|
             -> i64 {
                let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
                    Some(m) => m,
                    None => return pack_error(&mut caller, "missing memory export"),
                };
                let method = match read_string(&mut caller, &memory, method_ptr, method_len) {
                    Ok(s) => s,
                    Err(_) => return pack_error(&mut caller, "invalid method pointer"),
                };
                let args_json = match read_string(&mut caller, &memory, args_ptr, args_len) {
                    Ok(s) => s,
                    Err(_) => return pack_error(&mut caller, "invalid args pointer"),
                };
                let args: Value = serde_json::from_str(&args_json).unwrap_or(Value::Null);

                let bridge = caller.data().bridge.clone();
                let outcome = bridge.call_tool_blocking(method, args);
                let envelope = match outcome {
                    Ok(value) => serde_json::json!({ "ok": value }),
                    Err(err) => serde_json::json!({ "err": err.to_string() }),
                };
                write_json(&mut caller, &memory, &envelope)
            },
        )
        .map_err(|e| ClassifiedError::Code(format!("failed to link rpc_call: {e}")))?;

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| classify(&e.to_string()))?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| ClassifiedError::Code("module does not export memory".to_string()))?;
    let alloc: TypedFunc<i32, i32> = instance
        .get_typed_func(&mut store, "alloc")
        .map_err(|_| ClassifiedError::Code("module does not export alloc".to_string()))?;
    let execute: TypedFunc<(i32, i32), i64> = instance
        .get_typed_func(&mut store, "execute")
        .map_err(|_| ClassifiedError::Code("module does not export execute".to_string()))?;

    let args_bytes = serde_json::to_vec(&args)
        .map_err(|e| ClassifiedError::Code(format!("failed to encode args: {e}")))?;
    let args_ptr = alloc
        .call(&mut store, args_bytes.len() as i32)
        .map_err(|e| classify(&e.to_string()))?;
    memory
        .write(&mut store, args_ptr as usize, &args_bytes)
        .map_err(|e| ClassifiedError::Code(format!("failed to write args: {e}")))?;

    let packed = execute
        .call(&mut store, (args_ptr, args_bytes.len() as i32))
        .map_err(|e| classify(&e.to_string()))?;

    let (ptr, len) = unpack(packed);
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&store, ptr as usize, &mut buf)
        .map_err(|e| ClassifiedError::Code(format!("failed to read result: {e}")))?;
    let text = String::from_utf8(buf)
        .map_err(|e| ClassifiedError::Code(format!("result was not valid utf-8: {e}")))?;
    serde_json::from_str(&text)
        .map_err(|e| ClassifiedError::Code(format!("result was not valid json: {e}")))
}

fn unpack(packed: i64) -> (i32, i32) {
    let ptr = ((packed as u64) >> 32) as i32;
    let len = (packed as u64 & 0xFFFF_FFFF) as i32;
    (ptr, len)
}

fn pack(ptr: i32, len: i32) -> i64 {
    (((ptr as u32) as i64) << 32) | (len as u32) as i64
}

fn read_string(
    caller: &mut wasmtime::Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    let mut buf = vec![0u8; len as usize];
    memory.read(&mut *caller, ptr as usize, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn write_json(
    caller: &mut wasmtime::Caller<'_, HostState>,
    memory: &Memory,
    value: &Value,
) -> i64 {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    // Reuse a fixed scratch region at the start of the first memory page; a
    // production guest ABI would call back into the guest's `alloc` export,
    // but host functions cannot safely call back into a function still on
    // the same call stack with wasmtime's sync API, so responses are
    // written at a host-reserved offset agreed with the guest runtime.
    const HOST_SCRATCH_OFFSET: usize = 0;
    if memory.write(&mut *caller, HOST_SCRATCH_OFFSET, &bytes).is_err() {
        return pack(0, 0);
    }
    pack(HOST_SCRATCH_OFFSET as i32, bytes.len() as i32)
}

fn pack_error(caller: &mut wasmtime::Caller<'_, HostState>, message: &str) -> i64 {
    let memory = match caller.get_export("memory").and_then(|e| e.into_memory()) {
        Some(m) => m,
        None => return pack(0, 0),
    };
    write_json(caller, &memory, &serde_json::json!({ "err": message }))
}

/// Manages worker lifecycle across a `call` chain: lazy creation, reuse
/// within a chain, forced replacement after any fatal error class.
pub struct WorkerRunner {
    current: parking_lot::Mutex<Option<Arc<SandboxWorker>>>,
    execution_timeout: Duration,
}

impl WorkerRunner {
    pub fn new(execution_timeout: Duration) -> Self {
        Self {
            current: parking_lot::Mutex::new(None),
            execution_timeout,
        }
    }

    fn worker(&self) -> Arc<SandboxWorker> {
        let mut guard = self.current.lock();
        if let Some(worker) = guard.as_ref() {
            return worker.clone();
        }
        let worker = Arc::new(SandboxWorker::new());
        *guard = Some(worker.clone());
        worker
    }

    fn discard(&self) {
        *self.current.lock() = None;
    }

    pub async fn execute(&self, code: Vec<u8>, args: Value, bridge: RpcBridge) -> SandboxResult {
        let worker = self.worker();
        let result = worker
            .execute(code, args, bridge.clone(), self.execution_timeout)
            .await;

        match result {
            Ok(outcome) => {
                let fatal = matches!(
                    &outcome,
                    SandboxResult::Failure { error, .. }
                        if matches!(
                            error.code,
                            SandboxErrorCode::ExecutionTimeout | SandboxErrorCode::WorkerTerminated
                        )
                );
                if fatal {
                    bridge.fail_all_pending();
                    self.discard();
                }
                outcome
            }
            Err(WorkerError::Busy) => SandboxResult::failure(
                SandboxErrorCode::WorkerTerminated,
                "worker was already executing; this should not happen for a serial runner",
                0,
            ),
            Err(other) => {
                debug!(error = %other, "sandbox worker setup failed");
                self.discard();
                SandboxResult::failure(SandboxErrorCode::CodeError, other.to_string(), 0)
            }
        }
    }
}

impl Default for WorkerRunner {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_TIMEOUT)
    }
}
