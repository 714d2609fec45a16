//! Process-wide structured logging setup: an `EnvFilter` driven by `RUST_LOG`
//! (defaulting to `info`) with JSON output so log lines can be shipped to the
//! same aggregation pipeline as the rest of the fleet.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. Safe to call once per process;
/// a second call is a no-op (the underlying `set_global_default` error is
/// swallowed since test binaries commonly call this more than once).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init();
}
