//! Structured logging bootstrap (`SPEC_FULL.md` §A.2).
//!
//! The library itself never installs a global subscriber — only the
//! `tracing` macros are used inside `replica_engine`, so it composes
//! inside whatever process links it in. This module is a convenience for
//! binaries and tests, grounded on `init_tracing()` in the teacher
//! pack's `services/volume/src/server.rs`.

/// Installs a `tracing_subscriber::fmt` layer with an `EnvFilter` built
/// from `directive` (falling back to it if `RUST_LOG` isn't set).
pub fn init(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
