//! Tracing initialization for hosts and tests.

use crate::error::{Error, Result};

/// Initialize tracing with an env-filtered fmt subscriber.
///
/// Respects `RUST_LOG`, defaulting to `info`. Errors if a subscriber was
/// already installed.
pub fn init() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))
}
