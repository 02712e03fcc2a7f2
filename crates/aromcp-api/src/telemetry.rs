//! Tracing subscriber setup for the `aromcp` binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global subscriber. `RUST_LOG` controls filtering
/// (default `info`); `json` switches to machine-readable output.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
