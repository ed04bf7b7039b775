use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub db_path: String,
    pub api_url: String,
    /// Attempts before a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Concurrent remote calls per cycle.
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub probe_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: "reports.db".into(),
            api_url: "http://127.0.0.1:3001".into(),
            max_attempts: 3,
            max_in_flight: 4,
            request_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(300),
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("SATHI_DB_PATH").unwrap_or(defaults.db_path),
            api_url: std::env::var("SATHI_API_URL").unwrap_or(defaults.api_url),
            max_attempts: env_parse("SATHI_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            max_in_flight: env_parse("SATHI_SYNC_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_in_flight),
            request_timeout: env_millis("SATHI_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            backoff_base: env_millis("SATHI_BACKOFF_BASE_MS").unwrap_or(defaults.backoff_base),
            backoff_cap: env_millis("SATHI_BACKOFF_CAP_MS").unwrap_or(defaults.backoff_cap),
            probe_interval: env_millis("SATHI_PROBE_INTERVAL_MS")
                .unwrap_or(defaults.probe_interval),
        }
    }

    /// Minimum wait after the `attempt_count`-th failure before the next try.
    pub fn retry_delay(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt_count - 1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_cap)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
