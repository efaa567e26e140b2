//! Shared error taxonomy fragments. Each PML crate defines its own
//! `thiserror` enum at its public boundary; this module holds only the
//! pieces that are genuinely cross-cutting: the stable machine-readable
//! code every user-visible error must carry.

use serde::{Deserialize, Serialize};

/// Stable, machine-readable error codes shared across the gateway's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CodeError,
    PermissionDenied,
    ExecutionTimeout,
    RpcTimeout,
    WorkerTerminated,
    RpcError,
    IntegrityMismatch,
    BackendUnavailable,
    SandboxViolation,
    CapacityExceeded,
    ProtocolError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "UNKNOWN".to_string());
        write!(f, "{s}")
    }
}
