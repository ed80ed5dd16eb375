//! Tracing/logging initialization for the relay binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter directive applying `level` to the relay binary and its core crate.
pub fn default_filter(level: &str) -> String {
    format!("echorelay={level},echorelay_core={level}")
}

/// Install the process-wide subscriber. `RUST_LOG`, when set, replaces
/// `default_filter`; `log_json` switches to one JSON object per line for
/// device log shippers.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = std::env::var("RUST_LOG")
        .map_or_else(|_| EnvFilter::new(default_filter), EnvFilter::new);

    tracing_subscriber::registry()
        .with(filter)
        .with(log_json.then(|| fmt::layer().json()))
        .with((!log_json).then(fmt::layer))
        .init();
}
