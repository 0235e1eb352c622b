//! # Flash Sale Runtime
//!
//! The allocation engine: per-SKU batch workers, expiry triggers and the
//! [`Engine`] façade that ties them to the storage traits of `flashsale-core`.
//!
//! ## Core Components
//!
//! - **Batch planner** ([`plan`]): pure per-batch decisions
//! - **SKU worker** ([`worker`]): drain, plan, commit, publish, acknowledge
//! - **Engine** ([`engine`]): submission, status, availability, confirm,
//!   supervision and shutdown
//! - **Expiry** ([`expiry`]): one release path, three triggers
//! - **Resilience** ([`retry`], [`circuit_breaker`]): commit retries and a
//!   per-SKU breaker
//! - **Observability** ([`metrics`], [`health`])
//!
//! ## Example
//!
//! ```ignore
//! use flashsale_runtime::{Engine, EngineConfig};
//!
//! let engine = Engine::new(env, EngineConfig::default());
//! engine.start().await?;
//! engine.create_sale(&sku, 10).await?;
//!
//! let request_id = engine.submit(user, &sku, 1, key).await?;
//! let outcome = engine.await_outcome(request_id, Duration::from_secs(1)).await?;
//! ```

/// Read-through availability
pub mod availability;

/// Circuit breaker guarding ledger commits
pub mod circuit_breaker;

/// Engine configuration
pub mod config;

/// Engine façade and worker supervision
pub mod engine;

/// Injected backends
pub mod environment;

/// Expiry triggers and the shared release path
pub mod expiry;

/// Worker health reporting
pub mod health;

/// Prometheus metrics
pub mod metrics;

/// Pure batch planning
pub mod plan;

/// Recently decided idempotency keys
pub mod processed;

/// Reservation event publishing
pub mod publisher;

/// Retry with exponential backoff
pub mod retry;

/// Request status tracking
pub mod status;

/// Per-SKU batch allocator
pub mod worker;

/// Error types surfaced by the engine
pub mod error {
    use flashsale_core::ledger::LedgerError;
    use flashsale_core::queue::QueueError;
    use flashsale_core::types::{RequestId, ReservationId, SkuId};
    use thiserror::Error;

    /// Errors returned by [`Engine`](crate::Engine) operations.
    #[derive(Error, Debug)]
    pub enum EngineError {
        /// The SKU's queue is at its ceiling; try again later
        #[error("Queue full for SKU {sku_id} (depth {depth})")]
        QueueFull {
            /// Affected SKU
            sku_id: SkuId,
            /// Depth at rejection time
            depth: u64,
        },

        /// Only single-unit requests are accepted
        #[error("Invalid quantity {0}: exactly one unit per request")]
        InvalidQuantity(u32),

        /// No sale runs for this SKU
        #[error("Unknown SKU: {0}")]
        UnknownSku(SkuId),

        /// The SKU's allocator stopped on an invariant violation
        #[error("Allocation halted for SKU {0}")]
        Halted(SkuId),

        /// The SKU's ledger circuit is open
        #[error("Allocation degraded for SKU {0}, try again later")]
        Degraded(SkuId),

        /// The engine or the SKU's worker is already running
        #[error("Already running: {0}")]
        AlreadyRunning(String),

        /// No outcome within the wait budget
        #[error("Timed out waiting for request {0}")]
        Timeout(RequestId),

        /// Ledger failure
        #[error("Ledger error: {0}")]
        Ledger(#[from] LedgerError),

        /// Queue failure other than backpressure
        #[error("Queue error: {0}")]
        Queue(#[from] QueueError),

        /// `shutdown` was called
        #[error("Engine is shutting down")]
        ShuttingDown,
    }

    impl EngineError {
        /// Whether the caller should retry later
        #[must_use]
        pub const fn is_retryable(&self) -> bool {
            matches!(
                self,
                Self::QueueFull { .. } | Self::Degraded(_) | Self::Timeout(_)
            )
        }
    }

    /// Errors returned by [`Engine::confirm`](crate::Engine::confirm).
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ConfirmError {
        /// No such reservation
        #[error("Reservation not found: {0}")]
        NotFound(ReservationId),

        /// The hold lapsed before checkout
        #[error("Reservation expired: {0}")]
        Expired(ReservationId),

        /// Ledger failure
        #[error("Ledger error: {0}")]
        Ledger(LedgerError),
    }
}

pub use availability::AvailabilityView;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use config::EngineConfig;
pub use engine::Engine;
pub use environment::EngineEnvironment;
pub use error::{ConfirmError, EngineError};
pub use expiry::{
    ExpiryListener, ExpiryReactor, ExpirySweeper, HoldWatcher, ReleaseService, ReleaseTrigger,
    SweepReport,
};
pub use health::{HealthBoard, HealthCheck, HealthReport, HealthStatus, WorkerState};
pub use plan::{BatchPlan, BatchPlanner, Decision, DecisionOrigin};
pub use processed::ProcessedSet;
pub use publisher::EventPublisher;
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};
pub use status::{RequestStatus, StatusBoard};
pub use worker::{SkuWorker, WorkerContext, WorkerExit};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_and_degraded_are_retryable() {
        let full = EngineError::QueueFull {
            sku_id: flashsale_core::types::SkuId::new("sku"),
            depth: 10,
        };
        assert!(full.is_retryable());
        assert!(!EngineError::InvalidQuantity(2).is_retryable());
        assert!(!EngineError::Halted(flashsale_core::types::SkuId::new("sku")).is_retryable());
    }
}
