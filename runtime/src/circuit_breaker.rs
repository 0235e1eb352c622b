//! Per-SKU circuit breaker around batch commits.
//!
//! When a batch exhausts its retries the breaker opens: the worker stops taking
//! batches for that SKU, health reports `Degraded`, and after the timeout a
//! single probe batch decides whether to close again.
//!
//! # States
//!
//! - **Closed**: batches flow; failures are counted.
//! - **Open**: calls are rejected until the timeout elapses.
//! - **HalfOpen**: probe calls are let through; enough successes close it.
//!
//! # Example
//!
//! ```rust
//! use flashsale_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(1)
//!     .timeout(Duration::from_secs(5))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("sku-1", config);
//! let result = breaker.call(|| async { Ok::<_, String>(42) }).await;
//! assert!(result.is_ok());
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Time spent Open before a probe is allowed
    pub timeout: Duration,
    /// Successes in `HalfOpen` needed to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: usize,
    timeout: Duration,
    success_threshold: usize,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays Open.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub const fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            timeout: self.timeout,
            success_threshold: self.success_threshold,
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// Probing for recovery
    HalfOpen,
}

impl State {
    const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Errors from circuit breaker operations.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker scoped to one SKU.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<CircuitBreakerState>>,
    total_calls: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker labelled `name` in logs and metrics.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            state: Arc::new(RwLock::new(CircuitBreakerState {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current state of the breaker.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Configured Open duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Calls attempted and calls rejected so far.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_calls.load(Ordering::Relaxed),
            self.total_rejections.load(Ordering::Relaxed),
        )
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.can_attempt().await {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            CircuitBreakerMetrics::record_rejection(&self.name);
            tracing::debug!(breaker = %self.name, "Circuit breaker is OPEN, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;
        match state.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = state
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.config.timeout);
                if elapsed {
                    state.success_count = 0;
                    self.transition(&mut state, State::HalfOpen);
                }
                elapsed
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        match state.state {
            State::Closed | State::Open => state.failure_count = 0,
            State::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                    self.transition(&mut state, State::Closed);
                }
            }
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.opened_at = Some(Instant::now());
                    self.transition(&mut state, State::Open);
                }
            }
            State::HalfOpen => {
                state.failure_count = 1;
                state.success_count = 0;
                state.opened_at = Some(Instant::now());
                self.transition(&mut state, State::Open);
            }
            State::Open => state.failure_count += 1,
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: State) {
        let from = state.state;
        state.state = to;
        CircuitBreakerMetrics::record_state_change(&self.name, to.as_str(), to.as_gauge());
        if to == State::Open {
            tracing::warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = state.failure_count,
                "Circuit breaker opened"
            );
        } else {
            tracing::info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state change"
            );
        }
    }

    /// Force the breaker back to Closed.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
        if state.state != State::Closed {
            self.transition(&mut state, State::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .timeout(Duration::from_secs(5))
                .success_threshold(1)
                .build(),
        )
    }

    #[tokio::test]
    async fn stays_closed_on_success() {
        let breaker = breaker(1);
        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects() {
        let breaker = breaker(2);
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<i32, _>("down") }).await;
        }
        assert_eq!(breaker.state().await, State::Open);

        let rejected = breaker.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(matches!(rejected, Err(CircuitBreakerError::Open)));
        assert_eq!(breaker.stats(), (3, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_after_timeout_closes_on_success() {
        let breaker = breaker(1);
        let _ = breaker.call(|| async { Err::<i32, _>("down") }).await;
        assert_eq!(breaker.state().await, State::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        let probe = breaker.call(|| async { Ok::<_, &str>(1) }).await;
        assert!(probe.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = breaker(1);
        let _ = breaker.call(|| async { Err::<i32, _>("down") }).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let _ = breaker.call(|| async { Err::<i32, _>("still down") }).await;
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn reset_closes() {
        let breaker = breaker(1);
        let _ = breaker.call(|| async { Err::<i32, _>("down") }).await;
        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }
}
