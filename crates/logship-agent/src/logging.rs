//! Tracing subscriber setup for the agent.

use tracing_subscriber::{filter::EnvFilter, fmt};

/// Initialize the global tracing subscriber: env-filtered (`RUST_LOG`),
/// human-readable output. Safe to call more than once; later calls are
/// no-ops.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
