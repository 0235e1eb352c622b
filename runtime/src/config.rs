//! Engine tuning knobs.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Configuration shared by every SKU worker, the sweeper and the read path.
///
/// # Example
///
/// ```
/// use flashsale_runtime::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_batch_size(100)
///     .with_hold_duration(Duration::from_secs(120));
/// assert_eq!(config.batch_size, 100);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum requests drained per batch (`B`)
    pub batch_size: usize,
    /// Maximum time spent filling a batch (`W`)
    pub batch_max_wait: Duration,
    /// How long a reservation holds its unit
    pub hold_duration: Duration,
    /// Per-SKU queue depth at which submits are rejected
    pub queue_ceiling: u64,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// Maximum expired rows handled per sweep
    pub sweep_batch_limit: usize,
    /// How long decided keys and request statuses are kept
    pub processed_retention: Duration,
    /// TTL of cached availability
    pub cache_ttl: Duration,
    /// Backoff for failed batch commits
    pub retry: RetryPolicy,
    /// Per-SKU breaker that opens once a batch exhausts its retries
    pub circuit_breaker: CircuitBreakerConfig,
    /// Restarts allowed for a crashed worker before giving up
    pub max_worker_restarts: u32,
    /// Arm fast-path hold timers and consume their expiry signals
    pub enable_fast_path: bool,
    /// Run the periodic sweep
    pub enable_sweep: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            batch_max_wait: Duration::from_millis(10),
            hold_duration: Duration::from_secs(600),
            queue_ceiling: 50_000,
            sweep_interval: Duration::from_secs(10),
            sweep_batch_limit: 1_000,
            processed_retention: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(5),
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_secs(1))
                .build(),
            circuit_breaker: CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .timeout(Duration::from_secs(5))
                .success_threshold(1)
                .build(),
            max_worker_restarts: 5,
            enable_fast_path: true,
            enable_sweep: true,
        }
    }
}

impl EngineConfig {
    /// Set the maximum batch size
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the maximum batch fill time
    #[must_use]
    pub const fn with_batch_max_wait(mut self, wait: Duration) -> Self {
        self.batch_max_wait = wait;
        self
    }

    /// Set the reservation hold duration
    #[must_use]
    pub const fn with_hold_duration(mut self, hold: Duration) -> Self {
        self.hold_duration = hold;
        self
    }

    /// Set the per-SKU queue ceiling
    #[must_use]
    pub const fn with_queue_ceiling(mut self, ceiling: u64) -> Self {
        self.queue_ceiling = ceiling;
        self
    }

    /// Set the sweep interval
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the maximum rows per sweep
    #[must_use]
    pub const fn with_sweep_batch_limit(mut self, limit: usize) -> Self {
        self.sweep_batch_limit = limit;
        self
    }

    /// Set the processed-key retention
    #[must_use]
    pub const fn with_processed_retention(mut self, retention: Duration) -> Self {
        self.processed_retention = retention;
        self
    }

    /// Set the cache TTL
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the commit retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-SKU circuit breaker configuration
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set the worker restart budget
    #[must_use]
    pub const fn with_max_worker_restarts(mut self, restarts: u32) -> Self {
        self.max_worker_restarts = restarts;
        self
    }

    /// Enable or disable fast-path hold timers
    #[must_use]
    pub const fn with_fast_path(mut self, enabled: bool) -> Self {
        self.enable_fast_path = enabled;
        self
    }

    /// Enable or disable the periodic sweep
    #[must_use]
    pub const fn with_sweep(mut self, enabled: bool) -> Self {
        self.enable_sweep = enabled;
        self
    }
}
