//! Tracing subscriber setup for embedders that don't bring their own.

use tracing_subscriber::EnvFilter;

/// Initialize a fmt subscriber honoring `RUST_LOG`, defaulting to `info`
/// globally and `debug` for this crate. Safe to call once per process;
/// subsequent calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,yammer=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
