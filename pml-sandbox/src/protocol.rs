//! Message kinds exchanged across the main-process/worker boundary.
//! `id` correlates `execute`/`result`/`error`; `rpcId` correlates
//! `rpc`/`rpc_response`/`rpc_error`. The two correlation namespaces are
//! kept independent so a stale RPC response can never be mistaken for
//! an execution result or vice versa.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from the main process to run user-supplied code in a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub id: String,
    /// Compiled WebAssembly bytecode for the capability's `execute` export.
    /// The gateway never interprets a source language directly; callers
    /// compile to WASM upstream.
    pub code: Vec<u8>,
    pub args: Value,
}

/// A successful result reported by the worker for a given execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub id: String,
    pub value: Value,
}

/// An execution-level error reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerError {
    pub id: String,
    pub message: String,
    pub code: Option<String>,
}

/// A tool call made by sandboxed code, routed back out to the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub rpc_id: String,
    pub method: String,
    pub args: Value,
}

/// The main process's answer to an in-flight [`RpcCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub result: Value,
}

/// The main process's error answer to an in-flight [`RpcCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub id: String,
    pub error: Value,
}

/// The stable error-code taxonomy a [`SandboxResult`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxErrorCode {
    CodeError,
    PermissionDenied,
    ExecutionTimeout,
    RpcTimeout,
    WorkerTerminated,
    RpcError,
}

/// Tagged outcome of a single sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "success")]
pub enum SandboxResult {
    #[serde(rename = "true")]
    Success { value: Value, duration_ms: u64 },
    #[serde(rename = "false")]
    Failure {
        error: SandboxErrorDetail,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxErrorDetail {
    pub code: SandboxErrorCode,
    pub message: String,
    pub stack: Option<String>,
}

impl SandboxResult {
    pub fn duration_ms(&self) -> u64 {
        match self {
            SandboxResult::Success { duration_ms, .. } => *duration_ms,
            SandboxResult::Failure { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SandboxResult::Success { .. })
    }

    pub fn failure(code: SandboxErrorCode, message: impl Into<String>, duration_ms: u64) -> Self {
        SandboxResult::Failure {
            error: SandboxErrorDetail {
                code,
                message: message.into(),
                stack: None,
            },
            duration_ms,
        }
    }
}
