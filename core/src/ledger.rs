//! Inventory ledger: the transactional source of truth.
//!
//! The ledger holds per-SKU counters, reservations and the processed-key table.
//! Every mutation is atomic and the stock invariant `reserved + sold <= total`
//! is enforced by the store itself (CHECK constraints in Postgres, pre-mutation
//! checks in memory), never only by callers.

use crate::types::{
    AllocationCommit, ConfirmOutcome, IdempotencyKey, InventoryRecord, ProcessedKey,
    ReservationId, ReservationRecord, SkuId, UserId,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors returned by ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No inventory row exists for the SKU
    #[error("Unknown SKU: {0}")]
    UnknownSku(SkuId),

    /// Inventory for the SKU was already created
    #[error("Inventory already exists for SKU {0}")]
    AlreadyExists(SkuId),

    /// No reservation with this id
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// The hold lapsed before checkout confirmed it
    #[error("Reservation expired: {0}")]
    ReservationExpired(ReservationId),

    /// The commit would break `reserved + sold <= total` or another hard rule.
    ///
    /// Fatal for the SKU's allocator.
    #[error("Invariant violation for SKU {sku_id}: {detail}")]
    InvariantViolation {
        /// Affected SKU
        sku_id: SkuId,
        /// What was violated
        detail: String,
    },

    /// A uniqueness rule rejected the write (duplicate key or active reservation)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The transaction could not be committed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Connection or query failure
    #[error("Database error: {0}")]
    Database(String),
}

impl LedgerError {
    /// Whether replaying the same operation may succeed.
    ///
    /// Conflicts count as transient: a replayed batch re-reads its snapshot and
    /// answers already-decided keys from the processed-key table.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transaction(_) | Self::Database(_) | Self::Conflict(_)
        )
    }

    /// Whether the error must halt the SKU's allocator
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

/// Everything the allocator reads before planning a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchSnapshot {
    /// Current counters
    pub inventory: InventoryRecord,
    /// Already decided keys among the requested ones
    pub prior: HashMap<IdempotencyKey, ProcessedKey>,
    /// Requested keys that already name a reservation.
    ///
    /// Outlives `prior` once the processed-key row is purged after retention.
    pub reserved_keys: HashMap<IdempotencyKey, ReservationRecord>,
    /// Requested users that hold an active reservation or bought the SKU
    pub blocked_users: HashSet<UserId>,
}

impl BatchSnapshot {
    /// Snapshot with no prior outcomes or blocked users
    #[must_use]
    pub fn fresh(inventory: InventoryRecord) -> Self {
        Self {
            inventory,
            prior: HashMap::new(),
            reserved_keys: HashMap::new(),
            blocked_users: HashSet::new(),
        }
    }
}

/// Transactional store of inventory counters and reservations.
///
/// Implementations must make each mutating method a single atomic unit: either
/// everything it writes becomes visible or nothing does.
pub trait InventoryLedger: Send + Sync {
    /// Seed inventory for a SKU at sale setup.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyExists`] if the SKU was already created.
    fn create_inventory(
        &self,
        sku_id: &SkuId,
        total: u32,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>>;

    /// Authoritative read of a SKU's counters.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSku`] if the SKU does not exist.
    fn inventory(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>>;

    /// Counters, prior outcomes and existing reservations for `keys`, and
    /// blocked `users`, in one round trip.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSku`] if the SKU does not exist.
    fn batch_snapshot(
        &self,
        sku_id: &SkuId,
        keys: &[IdempotencyKey],
        users: &[UserId],
    ) -> Pin<Box<dyn Future<Output = Result<BatchSnapshot, LedgerError>> + Send + '_>>;

    /// Commit a batch: bump `reserved`, insert reservations, record outcomes.
    ///
    /// Returns the counters after the commit.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvariantViolation`] if the stock invariant would break
    /// - [`LedgerError::Conflict`] if a key or active reservation already exists
    /// - [`LedgerError::Transaction`] / [`LedgerError::Database`] on store failure
    fn apply_allocation(
        &self,
        commit: &AllocationCommit,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>>;

    /// Expire the given reservations of one SKU and return their units.
    ///
    /// Only rows still `Reserved` with `expires_at <= now` are transitioned;
    /// everything else is skipped. Returns the rows actually released.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownSku`] or a store failure.
    fn apply_release(
        &self,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>;

    /// Move a reservation's unit from `reserved` to `sold`.
    ///
    /// Confirming an already confirmed reservation succeeds without changes.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ReservationNotFound`] if absent
    /// - [`LedgerError::ReservationExpired`] if expired or past its deadline
    fn apply_confirm(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ConfirmOutcome, LedgerError>> + Send + '_>>;

    /// Point read of a reservation.
    ///
    /// # Errors
    ///
    /// Returns a store failure; absence is `Ok(None)`.
    fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>;

    /// `Reserved` rows past their deadline, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>;

    /// Outcome recorded for an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns a store failure; an undecided key is `Ok(None)`.
    fn processed_outcome(
        &self,
        key: &IdempotencyKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProcessedKey>, LedgerError>> + Send + '_>>;

    /// Drop processed keys decided before `older_than`; returns how many.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>>;
}
