//! Engine configuration and policy defaults.
//!
//! Defaults mirror conservative fabric-management practice: generous
//! per-attempt timeouts (a subnet administrator under sweep load answers
//! slowly), a long busy backoff, and a half-second sweep granularity.

use std::time::Duration;

/// Default hard retry budget per query (initial send not counted).
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default per-attempt response timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before resending after the service reports busy.
pub const DEFAULT_BUSY_BACKOFF: Duration = Duration::from_secs(10);

/// Default upper bound on the random jitter added to the busy backoff.
pub const DEFAULT_BUSY_JITTER: Duration = Duration::from_millis(1000);

/// Default interval between timeout sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on externally submitted queries outstanding at once.
pub const DEFAULT_MAX_OUTSTANDING: usize = 64;

/// Tunable policy for one engine instance.
///
/// `max_retries` and `attempt_timeout` are defaults only; each submission may
/// override them through its query options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget for queries that do not override it.
    pub max_retries: u32,
    /// Response timeout per send attempt for queries that do not override it.
    pub attempt_timeout: Duration,
    /// Base delay before resending a busied query.
    pub busy_backoff: Duration,
    /// Upper bound on the random jitter added to `busy_backoff`.
    pub busy_jitter: Duration,
    /// How often the sweeper scans for elapsed deadlines. Bounds the latency
    /// between a deadline expiring and the retry/fail transition it causes.
    pub sweep_interval: Duration,
    /// Cap on externally submitted queries outstanding at once. Child
    /// queries spawned by composite fan-out are not counted.
    pub max_outstanding: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_retries: DEFAULT_RETRY_COUNT,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            busy_backoff: DEFAULT_BUSY_BACKOFF,
            busy_jitter: DEFAULT_BUSY_JITTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, DEFAULT_RETRY_COUNT);
        assert_eq!(config.attempt_timeout, DEFAULT_ATTEMPT_TIMEOUT);
        assert_eq!(config.busy_backoff, DEFAULT_BUSY_BACKOFF);
        assert_eq!(config.sweep_interval, DEFAULT_SWEEP_INTERVAL);
        assert_eq!(config.max_outstanding, DEFAULT_MAX_OUTSTANDING);
    }

    #[test]
    fn test_sweep_interval_shorter_than_timeout() {
        // A sweep granularity coarser than the attempt timeout would make
        // every timeout observation late by multiple attempts.
        let config = EngineConfig::default();
        assert!(config.sweep_interval < config.attempt_timeout);
    }
}
