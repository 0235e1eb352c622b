//! Domain types for the flash-sale allocation engine.
//!
//! This module contains identifiers, the ledger records (`InventoryRecord`,
//! `ReservationRecord`), queued allocation requests and the terminal outcomes the
//! allocator hands back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a product with its own stock pool.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SkuId(String);

impl SkuId {
    /// Creates a `SkuId` from any string-like value
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the SKU as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SkuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SkuId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique identifier for a user (issued by the external auth layer)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Creates a new random `UserId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `UserId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Creates a new random `ReservationId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `ReservationId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one submitted allocation attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random `RequestId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `RequestId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token; resubmitting the same key has no additional effect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Wrap a caller-supplied key
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// Stock state for one SKU.
///
/// `available` is derived and never stored. The ledger rejects any mutation that
/// would leave `reserved + sold > total`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// SKU this record belongs to
    pub sku_id: SkuId,
    /// Units put on sale
    pub total: u32,
    /// Units held by active reservations
    pub reserved: u32,
    /// Units confirmed by checkout
    pub sold: u32,
    /// Incremented on every mutation
    pub version: u64,
}

impl InventoryRecord {
    /// Creates a fresh record with nothing reserved or sold
    #[must_use]
    pub const fn new(sku_id: SkuId, total: u32) -> Self {
        Self {
            sku_id,
            total,
            reserved: 0,
            sold: 0,
            version: 0,
        }
    }

    /// Units that can still be reserved
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.total
            .saturating_sub(self.reserved)
            .saturating_sub(self.sold)
    }

    /// Whether `reserved + sold <= total` holds
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        // u64 so that corrupted counters cannot overflow the check itself
        (self.reserved as u64) + (self.sold as u64) <= self.total as u64
    }

    /// Availability view of this record
    #[must_use]
    pub const fn availability(&self) -> Availability {
        Availability {
            available: self.available(),
            total: self.total,
        }
    }
}

/// Availability as served to readers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Units that can still be reserved
    pub available: u32,
    /// Units put on sale
    pub total: u32,
}

// ============================================================================
// Reservations
// ============================================================================

/// Lifecycle of a reservation.
///
/// `Reserved` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Unit held for the user until `expires_at`
    Reserved,
    /// Purchase completed by checkout
    Confirmed,
    /// Hold timed out and the unit went back to the pool
    Expired,
    /// Terminal audit-only state for requests that were never allocated
    Failed,
}

impl ReservationStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserved" => Some(Self::Reserved),
            "confirmed" => Some(Self::Confirmed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether no further transition is allowed
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Reserved)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A temporary hold on one unit for a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// Reservation identifier
    pub reservation_id: ReservationId,
    /// Request that produced the reservation
    pub request_id: RequestId,
    /// Holder
    pub user_id: UserId,
    /// Reserved SKU
    pub sku_id: SkuId,
    /// Current lifecycle state
    pub status: ReservationStatus,
    /// Key of the originating submission (unique across reservations)
    pub idempotency_key: IdempotencyKey,
    /// When the allocator committed the hold
    pub created_at: DateTime<Utc>,
    /// When the hold lapses unless confirmed
    pub expires_at: DateTime<Utc>,
}

impl ReservationRecord {
    /// Whether the hold has lapsed at `now` while still `Reserved`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at <= now
    }
}

// ============================================================================
// Requests and outcomes
// ============================================================================

/// One queued attempt to reserve a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Identifier handed back to the submitter
    pub request_id: RequestId,
    /// Requesting user
    pub user_id: UserId,
    /// Requested SKU
    pub sku_id: SkuId,
    /// Deduplication key
    pub idempotency_key: IdempotencyKey,
    /// Arrival time at the ingest queue
    pub enqueued_at: DateTime<Utc>,
}

/// A request as delivered by the ingest queue, tagged with its position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedRequest {
    /// Per-SKU position, strictly increasing in arrival order
    pub offset: u64,
    /// The queued request
    pub request: AllocationRequest,
}

/// Terminal result of an allocation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationOutcome {
    /// A unit is held for the user
    Reserved {
        /// The created reservation
        reservation_id: ReservationId,
        /// Hold deadline
        expires_at: DateTime<Utc>,
    },
    /// No stock was left when the request was reached
    OutOfStock,
    /// The user already holds or bought this SKU
    AlreadyReserved,
}

impl AllocationOutcome {
    /// Short label used in storage, logs and metrics
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved { .. } => "reserved",
            Self::OutOfStock => "out_of_stock",
            Self::AlreadyReserved => "already_reserved",
        }
    }

    /// The reservation created by this outcome, if any
    #[must_use]
    pub const fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            Self::Reserved { reservation_id, .. } => Some(*reservation_id),
            Self::OutOfStock | Self::AlreadyReserved => None,
        }
    }

    /// Whether a unit was allocated
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }
}

impl fmt::Display for AllocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded against an idempotency key once its request was decided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedKey {
    /// The deduplication key
    pub idempotency_key: IdempotencyKey,
    /// Request that was decided first for this key
    pub request_id: RequestId,
    /// Requesting user
    pub user_id: UserId,
    /// Requested SKU
    pub sku_id: SkuId,
    /// The decision
    pub outcome: AllocationOutcome,
    /// When the decision was committed
    pub processed_at: DateTime<Utc>,
}

impl ProcessedKey {
    /// The decision a stored reservation stands for, as first committed.
    #[must_use]
    pub fn from_reservation(reservation: &ReservationRecord) -> Self {
        Self {
            idempotency_key: reservation.idempotency_key.clone(),
            request_id: reservation.request_id,
            user_id: reservation.user_id,
            sku_id: reservation.sku_id.clone(),
            outcome: AllocationOutcome::Reserved {
                reservation_id: reservation.reservation_id,
                expires_at: reservation.expires_at,
            },
            processed_at: reservation.created_at,
        }
    }
}

/// Everything a single batch commit writes, applied in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationCommit {
    /// SKU whose counters change
    pub sku_id: SkuId,
    /// New `Reserved` rows; `reserved` grows by their count
    pub reservations: Vec<ReservationRecord>,
    /// One entry per newly decided idempotency key (allocated or not)
    pub processed: Vec<ProcessedKey>,
}

impl AllocationCommit {
    /// Creates an empty commit for `sku_id`
    #[must_use]
    pub const fn new(sku_id: SkuId) -> Self {
        Self {
            sku_id,
            reservations: Vec::new(),
            processed: Vec::new(),
        }
    }

    /// Units this commit allocates
    #[must_use]
    pub fn allocated(&self) -> u32 {
        u32::try_from(self.reservations.len()).unwrap_or(u32::MAX)
    }

    /// Whether the commit writes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty() && self.processed.is_empty()
    }
}

/// Result of a confirm call against the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmOutcome {
    /// The reservation after the call
    pub reservation: ReservationRecord,
    /// `false` when the reservation had already been confirmed earlier
    pub newly_confirmed: bool,
}
