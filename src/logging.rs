// Logging setup - tracing subscriber with env-based filtering
//
// Library code only emits through the `tracing` macros; installing a
// subscriber is the embedder's choice. `init` is a convenience for
// binaries and integration tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted for the log filter (e.g. `websift=debug`).
pub const LOG_ENV: &str = "WEBSIFT_LOG";

/// Install a global subscriber with an env-derived filter.
///
/// Defaults to `info` when the variable is unset or invalid. Calling this
/// twice is harmless; the second call is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
