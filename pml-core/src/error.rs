//! User-visible error taxonomy. Internal helpers return
//! `anyhow::Result`; this enum is what crosses the `pml-core` public
//! boundary so callers can match on a stable `code()`.

use pml_commons::ErrorCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PmlError {
    #[error("permission denied for tool `{tool_id}`")]
    PermissionDenied { tool_id: String },

    #[error("integrity mismatch for backend `{fqdn}`: user rejected the change")]
    IntegrityRejected { fqdn: String },

    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("sandboxed code attempted a forbidden operation: {message}")]
    SandboxViolation { message: String },

    #[error("capability code raised an error: {message}")]
    CodeError { message: String },

    #[error("request queue is at capacity")]
    CapacityExceeded,

    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    #[error("workflow `{workflow_id}` is unknown or has expired")]
    UnknownWorkflow { workflow_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PmlError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PmlError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            PmlError::IntegrityRejected { .. } => ErrorCode::IntegrityMismatch,
            PmlError::BackendUnavailable { .. } => ErrorCode::BackendUnavailable,
            PmlError::Timeout { .. } => ErrorCode::ExecutionTimeout,
            PmlError::SandboxViolation { .. } => ErrorCode::SandboxViolation,
            PmlError::CodeError { .. } => ErrorCode::CodeError,
            PmlError::CapacityExceeded => ErrorCode::CapacityExceeded,
            PmlError::ProtocolError { .. } => ErrorCode::ProtocolError,
            PmlError::UnknownWorkflow { .. } => ErrorCode::ProtocolError,
            PmlError::Other(_) => ErrorCode::CodeError,
        }
    }

    /// Render as the `{code, message}` shape every user-visible error
    /// and `SandboxResult` failure carries.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "code": self.code().to_string(),
            "message": self.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, PmlError>;
