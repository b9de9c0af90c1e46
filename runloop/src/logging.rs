//! Development-time tracing for the engine.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted.
//! - **Event log (`io/event_log`)**: the product record of every run in
//!   `<root>/<run_id>/events.jsonl`. Always written, unaffected by `RUST_LOG`.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=runloop=debug my-agent
/// ```
///
/// Panics if a global subscriber is already installed; use [`try_init`] when
/// that can happen.
pub fn init() {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

/// Like [`init`], but reports an already-installed subscriber as an error.
pub fn try_init() -> Result<()> {
    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}
