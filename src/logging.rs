//! Tracing setup.
//!
//! Mirrors the teacher's `main.rs` use of
//! `tracing_subscriber::fmt().with_env_filter(...).init()`, but derives the
//! filter from `RUST_LOG` rather than a `--log-level` flag: `spec.md` §6
//! states the CLI consumes no environment variables for its own behavior,
//! so `RUST_LOG` is kept as the one exception, scoped entirely to this
//! module (see `SPEC_FULL.md` §6.3).

use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Safe to call once, early in
/// `main`, before any namespace or mount operation so setup steps are logged.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
