//! Availability cache and fast-path hold timers.
//!
//! Neither is authoritative. The cache only serves reads; every write path goes
//! through the ledger. Hold timers only hint that a reservation may have
//! expired; the ledger decides.

use crate::types::{Availability, ReservationId, SkuId};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the cache and the hold timers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Could not reach the backend
    #[error("Cache connection error: {0}")]
    Connection(String),

    /// Stored value could not be decoded
    #[error("Cache value could not be decoded: {0}")]
    Decode(String),

    /// Backend rejected the command
    #[error("Cache command failed: {0}")]
    Command(String),
}

/// Short-TTL availability view.
pub trait AvailabilityCache: Send + Sync {
    /// Cached availability, `None` on miss or after expiry.
    ///
    /// # Errors
    ///
    /// Returns a backend failure; callers fall back to the ledger.
    fn get(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Availability>, CacheError>> + Send + '_>>;

    /// Store availability for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns a backend failure.
    fn put(
        &self,
        sku_id: &SkuId,
        availability: Availability,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>>;

    /// Drop the entry for a SKU.
    ///
    /// # Errors
    ///
    /// Returns a backend failure.
    fn invalidate(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>>;
}

/// Signal that a hold's timer fired.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldExpiry {
    /// SKU of the reservation
    pub sku_id: SkuId,
    /// Reservation whose timer fired
    pub reservation_id: ReservationId,
}

/// Stream of fired hold timers.
pub type HoldExpiryStream = Pin<Box<dyn Stream<Item = HoldExpiry> + Send>>;

/// Self-expiring per-reservation entries whose expiry is an early signal.
pub trait HoldTimers: Send + Sync {
    /// Arm a timer that fires at `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns a backend failure. Losing a timer is harmless: the sweep
    /// releases the reservation anyway.
    fn arm(
        &self,
        sku_id: &SkuId,
        reservation_id: ReservationId,
        expires_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>>;

    /// Cancel a timer (reservation confirmed).
    ///
    /// # Errors
    ///
    /// Returns a backend failure.
    fn disarm(
        &self,
        sku_id: &SkuId,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>>;

    /// Stream of timers that fired after the subscription.
    ///
    /// # Errors
    ///
    /// Returns a backend failure.
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HoldExpiryStream, CacheError>> + Send + '_>>;
}
