//! Reservation events and their wire envelope.
//!
//! Every allocation decision, expiry and confirmation is published as a
//! [`ReservationEvent`]. Events are serialized with `bincode` and wrapped in a
//! [`SerializedEvent`] whose `key` is the SKU, so a partitioned bus keeps each
//! SKU's events in order.
//!
//! # Example
//!
//! ```
//! use flashsale_core::event::{Event, ReservationEvent, SerializedEvent};
//! use flashsale_core::types::{SkuId, UserId, RequestId};
//! use flashsale_core::event::FailureReason;
//! use chrono::Utc;
//!
//! let event = ReservationEvent::Failed {
//!     request_id: RequestId::new(),
//!     user_id: UserId::new(),
//!     sku_id: SkuId::new("sku-1"),
//!     reason: FailureReason::OutOfStock,
//!     timestamp: Utc::now(),
//! };
//!
//! let serialized = SerializedEvent::from_event(&event).unwrap();
//! assert_eq!(serialized.event_type, "reservation.failed");
//! assert_eq!(serialized.key, "sku-1");
//! ```

use crate::types::{
    AllocationOutcome, ProcessedKey, RequestId, ReservationId, ReservationRecord, SkuId, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Topic every reservation event is published to.
pub const RESERVATION_TOPIC: &str = "reservation-events";

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be published on the bus.
///
/// `event_type()` returns a stable identifier used for routing on the consumer
/// side; `partition_key()` decides which partition the event lands in.
pub trait Event: Send + Sync + 'static {
    /// Stable event type identifier (for example `"reservation.created"`).
    fn event_type(&self) -> &'static str;

    /// Key used to keep related events in order.
    fn partition_key(&self) -> String;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Why a request ended without a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Stock ran out before the request was reached
    OutOfStock,
    /// The user already holds or bought this SKU
    AlreadyReserved,
}

impl FailureReason {
    /// Short label used in logs
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::AlreadyReserved => "already_reserved",
        }
    }
}

/// Audit and notification events emitted by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationEvent {
    /// A unit was allocated to the user
    Created {
        /// New reservation
        reservation_id: ReservationId,
        /// Originating request
        request_id: RequestId,
        /// Holder
        user_id: UserId,
        /// Reserved SKU
        sku_id: SkuId,
        /// Hold deadline
        expires_at: DateTime<Utc>,
        /// Commit time
        timestamp: DateTime<Utc>,
    },
    /// A request was decided without allocating
    Failed {
        /// Originating request
        request_id: RequestId,
        /// Requesting user
        user_id: UserId,
        /// Requested SKU
        sku_id: SkuId,
        /// Decision
        reason: FailureReason,
        /// Commit time
        timestamp: DateTime<Utc>,
    },
    /// A hold lapsed and its unit went back to the pool
    Expired {
        /// Released reservation
        reservation_id: ReservationId,
        /// Former holder
        user_id: UserId,
        /// SKU whose stock was restored
        sku_id: SkuId,
        /// Release time
        timestamp: DateTime<Utc>,
    },
    /// Checkout completed the purchase
    Confirmed {
        /// Confirmed reservation
        reservation_id: ReservationId,
        /// Buyer
        user_id: UserId,
        /// Sold SKU
        sku_id: SkuId,
        /// Confirmation time
        timestamp: DateTime<Utc>,
    },
}

impl ReservationEvent {
    /// Event describing a freshly decided key.
    #[must_use]
    pub fn decided(processed: &ProcessedKey) -> Self {
        match &processed.outcome {
            AllocationOutcome::Reserved {
                reservation_id,
                expires_at,
            } => Self::Created {
                reservation_id: *reservation_id,
                request_id: processed.request_id,
                user_id: processed.user_id,
                sku_id: processed.sku_id.clone(),
                expires_at: *expires_at,
                timestamp: processed.processed_at,
            },
            AllocationOutcome::OutOfStock => Self::failed(processed, FailureReason::OutOfStock),
            AllocationOutcome::AlreadyReserved => {
                Self::failed(processed, FailureReason::AlreadyReserved)
            }
        }
    }

    fn failed(processed: &ProcessedKey, reason: FailureReason) -> Self {
        Self::Failed {
            request_id: processed.request_id,
            user_id: processed.user_id,
            sku_id: processed.sku_id.clone(),
            reason,
            timestamp: processed.processed_at,
        }
    }

    /// Event for a reservation the ledger just released.
    #[must_use]
    pub fn expired(reservation: &ReservationRecord, timestamp: DateTime<Utc>) -> Self {
        Self::Expired {
            reservation_id: reservation.reservation_id,
            user_id: reservation.user_id,
            sku_id: reservation.sku_id.clone(),
            timestamp,
        }
    }

    /// Event for a reservation checkout just confirmed.
    #[must_use]
    pub fn confirmed(reservation: &ReservationRecord, timestamp: DateTime<Utc>) -> Self {
        Self::Confirmed {
            reservation_id: reservation.reservation_id,
            user_id: reservation.user_id,
            sku_id: reservation.sku_id.clone(),
            timestamp,
        }
    }

    /// SKU the event belongs to
    #[must_use]
    pub const fn sku_id(&self) -> &SkuId {
        match self {
            Self::Created { sku_id, .. }
            | Self::Failed { sku_id, .. }
            | Self::Expired { sku_id, .. }
            | Self::Confirmed { sku_id, .. } => sku_id,
        }
    }

    /// Reservation the event refers to; absent for failed requests
    #[must_use]
    pub const fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            Self::Created { reservation_id, .. }
            | Self::Expired { reservation_id, .. }
            | Self::Confirmed { reservation_id, .. } => Some(*reservation_id),
            Self::Failed { .. } => None,
        }
    }
}

impl Event for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "reservation.created",
            Self::Failed { .. } => "reservation.failed",
            Self::Expired { .. } => "reservation.expired",
            Self::Confirmed { .. } => "reservation.confirmed",
        }
    }

    fn partition_key(&self) -> String {
        self.sku_id().to_string()
    }
}

/// A serialized event ready for the bus.
///
/// `key` is the partition key; `data` holds the bincode payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., `"reservation.expired"`).
    pub event_type: String,

    /// Partition key.
    pub key: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(event_type: String, key: String, data: Vec<u8>) -> Self {
        Self {
            event_type,
            key,
            data,
        }
    }

    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(event: &E) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            key: event.partition_key(),
            data: event.to_bytes()?,
        })
    }

    /// Decode the payload back into a typed event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload does not decode.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        E::from_bytes(&self.data)
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, key: {}, size: {} bytes }}",
            self.event_type,
            self.key,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdempotencyKey;

    fn processed(outcome: AllocationOutcome) -> ProcessedKey {
        ProcessedKey {
            idempotency_key: IdempotencyKey::new("k-1"),
            request_id: RequestId::new(),
            user_id: UserId::new(),
            sku_id: SkuId::new("sku-7"),
            outcome,
            processed_at: Utc::now(),
        }
    }

    #[test]
    fn decided_maps_outcomes_to_event_types() {
        let reserved = processed(AllocationOutcome::Reserved {
            reservation_id: ReservationId::new(),
            expires_at: Utc::now(),
        });
        assert_eq!(
            ReservationEvent::decided(&reserved).event_type(),
            "reservation.created"
        );

        let out = ReservationEvent::decided(&processed(AllocationOutcome::OutOfStock));
        assert_eq!(out.event_type(), "reservation.failed");
        assert!(out.reservation_id().is_none());

        let limited = ReservationEvent::decided(&processed(AllocationOutcome::AlreadyReserved));
        assert!(matches!(
            limited,
            ReservationEvent::Failed {
                reason: FailureReason::AlreadyReserved,
                ..
            }
        ));
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn serialized_event_is_keyed_by_sku_and_decodes() {
        let event = ReservationEvent::decided(&processed(AllocationOutcome::OutOfStock));

        let serialized = SerializedEvent::from_event(&event).expect("serialization should succeed");
        assert_eq!(serialized.key, "sku-7");

        let decoded: ReservationEvent = serialized.decode().expect("decode should succeed");
        assert_eq!(decoded, event);
    }

    #[test]
    fn serialized_event_display() {
        let serialized = SerializedEvent::new(
            "reservation.expired".to_string(),
            "sku-1".to_string(),
            vec![1, 2, 3, 4, 5],
        );

        let display = format!("{serialized}");
        assert!(display.contains("reservation.expired"));
        assert!(display.contains("5 bytes"));
    }
}
