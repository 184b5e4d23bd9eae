//! Engine options.
//!
//! Everything has a sensible default; `from_env` overrides from the
//! environment for deployments that tune without recompiling. In local
//! dev, call `dotenvy::dotenv().ok()` in the host before `from_env`.

use std::time::Duration;

/// Tunables shared by the executor, controllers, and reference providers.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Backoff applied to definition/construction errors and as the final
    /// fallback for retry policy intervals.
    pub error_retry_interval: chrono::Duration,
    /// When false, lifecycle notifications are dropped at the publisher.
    pub enable_lifecycle_events: bool,
    /// Poll interval for activity long-polling.
    pub activity_poll_interval: Duration,
    /// How long a dequeue waits on an empty queue before returning `None`.
    pub queue_dequeue_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            error_retry_interval: chrono::Duration::seconds(60),
            enable_lifecycle_events: true,
            activity_poll_interval: Duration::from_millis(100),
            queue_dequeue_timeout: Duration::from_millis(100),
        }
    }
}

impl EngineOptions {
    /// Load options from `BRAID_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            error_retry_interval: env_i64("BRAID_ERROR_RETRY_SECS")
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.error_retry_interval),
            enable_lifecycle_events: std::env::var("BRAID_LIFECYCLE_EVENTS")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(defaults.enable_lifecycle_events),
            activity_poll_interval: env_i64("BRAID_ACTIVITY_POLL_MS")
                .map(|ms| Duration::from_millis(ms.max(1) as u64))
                .unwrap_or(defaults.activity_poll_interval),
            queue_dequeue_timeout: env_i64("BRAID_DEQUEUE_TIMEOUT_MS")
                .map(|ms| Duration::from_millis(ms.max(1) as u64))
                .unwrap_or(defaults.queue_dequeue_timeout),
        }
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
