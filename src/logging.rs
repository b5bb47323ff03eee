// ABOUTME: Tracing subscriber setup for farm and worker binaries.
// ABOUTME: Logs go to stderr because a worker's stdout carries the protocol.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "procfarm=info";

/// Install a stderr subscriber filtered by `RUST_LOG`, defaulting to
/// [`DEFAULT_FILTER`]. Does nothing if a subscriber is already set.
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Like [`init`] with a custom fallback filter.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init();
}
