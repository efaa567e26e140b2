//! Shared helpers reused across the PML workspace: error code taxonomy,
//! workspace path layout, `${VAR}` expansion, secret sanitization, and
//! tracing bootstrap. Kept dependency-light so `pml-sandbox` and
//! `pml-shgat` can use it without pulling in `pml-core`.

pub mod env_expand;
pub mod errors;
pub mod paths;
pub mod sanitize;
pub mod telemetry;

pub use errors::ErrorCode;
