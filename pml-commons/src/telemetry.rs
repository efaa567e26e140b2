//! Tracing subscriber bootstrap, mirroring `vtcode`'s
//! `initialize_tracing` (`src/main_helpers.rs`): `RUST_LOG` drives an
//! `EnvFilter`, `PML_DEBUG`/`PML_VERBOSE` are cheap aliases for common
//! filter directives, and re-initialization is a warn-and-continue, not a
//! panic (a host process may have already installed a subscriber).

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the global tracing subscriber from environment variables.
/// Idempotent: a second call logs a warning and leaves the existing
/// subscriber in place instead of panicking.
pub fn init_tracing() {
    let filter = resolve_filter();
    let fmt_layer = fmt::layer().with_target(true);

    let init_result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();

    if let Err(err) = init_result {
        tracing::warn!(error = %err, "tracing subscriber already initialized; skipping");
    }
}

fn resolve_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    if std::env::var("PML_DEBUG").is_ok() {
        return EnvFilter::new("debug");
    }
    if std::env::var("PML_VERBOSE").is_ok() {
        return EnvFilter::new("info");
    }
    EnvFilter::new("warn")
}
