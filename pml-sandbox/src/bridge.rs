//! Full-duplex correlation layer between the main process and a sandbox
//! worker. The bridge owns two independent correlation tables — one for
//! `execute`/`result`/`error` triples keyed by execution `id`, one for
//! `rpc`/`rpc_response`/`rpc_error` triples keyed by `rpcId` — so
//! in-flight tool calls and the execution they belong to are never
//! confused even though neither table guarantees FIFO delivery.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use crate::protocol::{RpcCall, SandboxErrorCode};

/// Default timeout for a single outbound RPC (tool call) made by sandboxed
/// code.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for an entire sandbox execution.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("rpc call timed out")]
    RpcTimeout,
    #[error("worker terminated while rpc call was in flight")]
    WorkerTerminated,
    #[error("rpc call failed: {0}")]
    RpcError(Value),
}

impl BridgeError {
    pub fn code(&self) -> SandboxErrorCode {
        match self {
            BridgeError::RpcTimeout => SandboxErrorCode::RpcTimeout,
            BridgeError::WorkerTerminated => SandboxErrorCode::WorkerTerminated,
            BridgeError::RpcError(_) => SandboxErrorCode::RpcError,
        }
    }
}

type RpcSlot = oneshot::Sender<Result<Value, Value>>;

/// Multiplexed RPC bridge for one in-flight sandbox execution.
///
/// Cloning shares the same underlying correlation tables and outbound
/// channel, which is what lets the worker-side blocking host function and
/// the main-process dispatcher hold independent handles.
#[derive(Clone)]
pub struct RpcBridge {
    pending: std::sync::Arc<Mutex<HashMap<String, RpcSlot>>>,
    outbound: mpsc::UnboundedSender<RpcCall>,
    rpc_timeout: Duration,
}

impl RpcBridge {
    /// Create a bridge plus the receiver side of the outbound-`rpc` channel,
    /// which the caller (the capability loader's dispatch loop) drains to
    /// actually route each tool call.
    pub fn new(rpc_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<RpcCall>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        (
            Self {
                pending: std::sync::Arc::new(Mutex::new(HashMap::new())),
                outbound,
                rpc_timeout,
            },
            inbound,
        )
    }

    /// Called from inside the worker (on a blocking thread) when sandboxed
    /// code performs a tool call. Registers a correlation slot, emits the
    /// `rpc` message, and blocks the calling thread until a response
    /// arrives or the per-call timeout elapses.
    pub fn call_tool_blocking(
        &self,
        method: String,
        args: Value,
    ) -> Result<Value, BridgeError> {
        let rpc_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(rpc_id.clone(), tx);

        if self
            .outbound
            .send(RpcCall {
                rpc_id: rpc_id.clone(),
                method,
                args,
            })
            .is_err()
        {
            self.pending.lock().remove(&rpc_id);
            return Err(BridgeError::WorkerTerminated);
        }

        let handle = tokio::runtime::Handle::current();
        let result = handle.block_on(async { timeout(self.rpc_timeout, rx).await });

        self.pending.lock().remove(&rpc_id);
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(BridgeError::RpcError(err)),
            Ok(Err(_canceled)) => Err(BridgeError::WorkerTerminated),
            Err(_elapsed) => Err(BridgeError::RpcTimeout),
        }
    }

    /// Resolve a pending RPC call with a successful `rpc_response`. A
    /// missing or already-resolved id is a no-op: at-most-one delivery is
    /// the correlation table's job, matching the at-most-once consumption
    /// guarantee the pending-approval store also provides.
    pub fn resolve(&self, rpc_id: &str, result: Value) {
        if let Some(tx) = self.pending.lock().remove(rpc_id) {
            let _ = tx.send(Ok(result));
        }
    }

    /// Resolve a pending RPC call with an `rpc_error`.
    pub fn reject(&self, rpc_id: &str, error: Value) {
        if let Some(tx) = self.pending.lock().remove(rpc_id) {
            let _ = tx.send(Err(error));
        }
    }

    /// Fail every still-pending correlation with `WORKER_TERMINATED`. Called
    /// once the worker is torn down (fatal error class or hard timeout).
    pub fn fail_all_pending(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn resolve_delivers_to_caller() {
        let (bridge, mut inbound) = RpcBridge::new(Duration::from_millis(500));
        let bridge2 = bridge.clone();

        let call = tokio::task::spawn_blocking(move || {
            bridge2.call_tool_blocking("fs:read_file".to_string(), Value::Null)
        });

        let rpc = inbound.recv().await.expect("rpc call emitted");
        assert_eq!(rpc.method, "fs:read_file");
        bridge.resolve(&rpc.rpc_id, Value::String("ok".to_string()));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, Value::String("ok".to_string()));
    }

    #[tokio::test]
    async fn unresolved_call_times_out() {
        let (bridge, _inbound) = RpcBridge::new(Duration::from_millis(20));
        let bridge2 = bridge.clone();

        let call = tokio::task::spawn_blocking(move || {
            bridge2.call_tool_blocking("slow:op".to_string(), Value::Null)
        });

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::RpcTimeout));
    }

    #[tokio::test]
    async fn teardown_fails_pending_calls() {
        let (bridge, mut inbound) = RpcBridge::new(Duration::from_secs(5));
        let bridge2 = bridge.clone();

        let call = tokio::task::spawn_blocking(move || {
            bridge2.call_tool_blocking("fs:read_file".to_string(), Value::Null)
        });
        let _rpc = inbound.recv().await.expect("rpc call emitted");
        bridge.fail_all_pending();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::WorkerTerminated));
    }
}
