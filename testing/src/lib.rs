//! # Flash Sale Testing
//!
//! Testing utilities for the flash-sale allocation engine.
//!
//! This crate provides:
//! - In-memory implementations of every backend trait (ledger, queue, cache,
//!   hold timers, event bus) with fault injection hooks
//! - Deterministic clocks
//! - [`BatchPlanTest`], a Given-When-Then harness for the batch planner
//!
//! ## Example
//!
//! ```ignore
//! use flashsale_testing::InMemoryBackends;
//! use flashsale_runtime::{Engine, EngineConfig};
//!
//! #[tokio::test]
//! async fn sells_out() {
//!     let backends = InMemoryBackends::default();
//!     let engine = Engine::new(backends.environment(), EngineConfig::default());
//!     engine.start().await.unwrap();
//!     engine.create_sale(&sku, 10).await.unwrap();
//!     // submit, await_outcome, assert on backends.ledger / backends.bus
//! }
//! ```

use chrono::{DateTime, Utc};
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_runtime::EngineEnvironment;
use std::sync::Arc;

/// In-memory availability cache and hold timers
pub mod cache;

/// In-memory event bus
pub mod event_bus;

/// In-memory inventory ledger
pub mod ledger;


/// proptest strategies
pub mod properties;

/// In-memory ingest queue
pub mod queue;

/// Clock implementations for tests.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::RwLock;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flashsale_testing::mocks::FixedClock;
    /// use flashsale_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Clock frozen at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC
    ///
    /// # Panics
    ///
    /// Never in practice: the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Useful for ledger-level tests of deadlines (`apply_release`,
    /// `apply_confirm`) without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: RwLock<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock starting at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: RwLock::new(time),
            }
        }

        /// Move the clock forward
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Wall-clock time that follows tokio's clock.
    ///
    /// Under `#[tokio::test(start_paused = true)]` it advances exactly with
    /// `tokio::time::advance` and auto-advance, so hold deadlines, tokio
    /// sleeps and sweep intervals stay in step.
    #[derive(Debug, Clone)]
    pub struct TokioClock {
        base: DateTime<Utc>,
        started: tokio::time::Instant,
    }

    impl TokioClock {
        /// Clock reading `Utc::now()` at creation, then following tokio time
        #[must_use]
        pub fn new() -> Self {
            Self {
                base: Utc::now(),
                started: tokio::time::Instant::now(),
            }
        }
    }

    impl Default for TokioClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.base + elapsed
        }
    }
}

/// Every in-memory backend, kept concrete so tests can inspect and inject.
#[derive(Clone)]
pub struct InMemoryBackends {
    /// Ledger
    pub ledger: Arc<ledger::InMemoryLedger>,
    /// Ingest queue
    pub queue: Arc<queue::InMemoryIngestQueue>,
    /// Availability cache
    pub cache: Arc<cache::InMemoryAvailabilityCache>,
    /// Hold timers
    pub timers: Arc<cache::InMemoryHoldTimers>,
    /// Event bus
    pub bus: Arc<event_bus::InMemoryEventBus>,
    /// Clock shared by the engine and the timers
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackends")
            .field("ledger", &self.ledger)
            .field("queue", &self.queue)
            .field("cache", &self.cache)
            .field("timers", &self.timers)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl InMemoryBackends {
    /// Backends on `clock` with a queue rejecting at `queue_ceiling`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, queue_ceiling: u64) -> Self {
        Self {
            ledger: Arc::new(ledger::InMemoryLedger::new()),
            queue: Arc::new(queue::InMemoryIngestQueue::new(queue_ceiling)),
            cache: Arc::new(cache::InMemoryAvailabilityCache::new()),
            timers: Arc::new(cache::InMemoryHoldTimers::new(Arc::clone(&clock))),
            bus: Arc::new(event_bus::InMemoryEventBus::new()),
            clock,
        }
    }

    /// Backends following tokio time, for `start_paused` tests
    #[must_use]
    pub fn with_tokio_clock() -> Self {
        Self::new(Arc::new(mocks::TokioClock::new()), u64::MAX)
    }

    /// The engine's view of these backends
    #[must_use]
    pub fn environment(&self) -> EngineEnvironment {
        EngineEnvironment {
            ledger: self.ledger.clone(),
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            timers: self.timers.clone(),
            bus: self.bus.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl Default for InMemoryBackends {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), u64::MAX)
    }
}

/// System-clock backends and their engine environment
#[must_use]
pub fn in_memory_environment() -> (EngineEnvironment, InMemoryBackends) {
    let backends = InMemoryBackends::default();
    (backends.environment(), backends)
}

// Re-export commonly used items
pub use cache::{InMemoryAvailabilityCache, InMemoryHoldTimers};
pub use event_bus::InMemoryEventBus;
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, ManualClock, TokioClock, test_clock};
pub use plan_test::BatchPlanTest;
pub use queue::InMemoryIngestQueue;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(test_clock().now());
        let before = clock.now();
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        assert_eq!(clock.now() - before, chrono::Duration::seconds(3));
    }
}
