//! Core of the Procedural Memory Layer gateway: the capability loader
//! state machine and the subsystems it coordinates — routing,
//! permissions, integrity, pending approvals, the tool index, the
//! subprocess pool, execution tracing, dependency learning, and the
//! DAG-ordered parallel executor. Sandboxed code execution lives in
//! `pml-sandbox`; SHGAT ranking lives in `pml-shgat`.

pub mod approval;
pub mod config;
pub mod dag;
pub mod error;
pub mod index;
pub mod learning;
pub mod loader;
pub mod lockfile;
pub mod model;
pub mod permission;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod subprocess;
pub mod trace;

pub use error::{PmlError, Result};
pub use loader::CapabilityLoader;
pub use model::{Capability, ToolId};
