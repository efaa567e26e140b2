//! Sandboxed code execution core: an RPC bridge that
//! multiplexes tool calls out of an isolated worker, and the worker
//! lifecycle that runs untrusted capability code with zero ambient
//! authority.

pub mod bridge;
pub mod protocol;
pub mod worker;

pub use bridge::{BridgeError, RpcBridge, DEFAULT_EXECUTION_TIMEOUT, DEFAULT_RPC_TIMEOUT};
pub use protocol::{RpcCall, SandboxErrorCode, SandboxErrorDetail, SandboxResult};
pub use worker::{SandboxWorker, WorkerError, WorkerRunner};
