//! Injected backends.

use flashsale_core::cache::{AvailabilityCache, HoldTimers};
use flashsale_core::environment::Clock;
use flashsale_core::event_bus::EventBus;
use flashsale_core::ledger::InventoryLedger;
use flashsale_core::queue::IngestQueue;
use std::sync::Arc;

/// Everything the engine talks to, as trait objects.
///
/// Production wires Postgres, Redis and Redpanda; tests wire the in-memory
/// versions from `flashsale-testing`.
#[derive(Clone)]
pub struct EngineEnvironment {
    /// Source of truth for counters and reservations
    pub ledger: Arc<dyn InventoryLedger>,
    /// Per-SKU request queue
    pub queue: Arc<dyn IngestQueue>,
    /// Availability cache
    pub cache: Arc<dyn AvailabilityCache>,
    /// Fast-path hold timers
    pub timers: Arc<dyn HoldTimers>,
    /// Reservation event bus
    pub bus: Arc<dyn EventBus>,
    /// Time source for deadlines and retention
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EngineEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEnvironment").finish_non_exhaustive()
    }
}
