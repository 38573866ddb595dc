//! Tracing subscriber set-up for the binary.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build the filter: an explicit level wins, then `RUST_LOG`, then `default`.
pub fn build_filter(explicit: Option<&str>, default: &str) -> EnvFilter {
    if let Some(level) = explicit
        && let Ok(filter) = EnvFilter::try_new(level)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Logs go to stderr so progress output on
/// stdout stays clean. Safe to call more than once; later calls are no-ops.
pub fn init(level: Option<&str>, json: bool) {
    let filter = build_filter(level, "autoship=info,warn");
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("[autoship] logging already initialised: {}", e);
    }
}
