//! Tracing bootstrap
//!
//! Mirrors the controller's startup wiring so embedders and tests get the
//! same env-filtered, formatted output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the given level applies to this
/// crate and `info` to everything else. Safe to call more than once (only
/// the first call installs a subscriber).
pub fn init(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("watchman_core={level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
