//! # Flash Sale Core
//!
//! Domain types and storage traits for the flash-sale allocation engine.
//!
//! This crate holds no I/O. It defines what the engine talks to:
//!
//! - [`ledger::InventoryLedger`]: transactional source of truth for counters and reservations
//! - [`queue::IngestQueue`]: per-SKU ordered request channel
//! - [`cache::AvailabilityCache`] and [`cache::HoldTimers`]: non-authoritative fast paths
//! - [`event_bus::EventBus`]: reservation audit stream
//!
//! Backends live in sibling crates (`flashsale-postgres`, `flashsale-redis`,
//! `flashsale-redpanda`) and in-memory versions in `flashsale-testing`.
//!
//! ## Invariants
//!
//! - `reserved + sold <= total` for every SKU at every commit
//! - at most one active (`Reserved` or `Confirmed`) reservation per user and SKU
//! - an idempotency key is decided at most once

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod cache;
pub mod event;
pub mod event_bus;
pub mod ledger;
pub mod queue;
pub mod types;

pub use cache::{AvailabilityCache, CacheError, HoldExpiry, HoldExpiryStream, HoldTimers};
pub use event::{Event, EventError, FailureReason, RESERVATION_TOPIC, ReservationEvent, SerializedEvent};
pub use event_bus::{EventBus, EventBusError, EventStream};
pub use ledger::{BatchSnapshot, InventoryLedger, LedgerError};
pub use queue::{IngestQueue, QueueError};
pub use types::*;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Hold deadlines, sweeps and processed-key retention all read time through
    /// this trait so tests can drive them deterministically.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
