//! In-memory inventory ledger.
//!
//! Enforces the same hard rules as the Postgres schema, checked before any
//! mutation so a rejected commit leaves no trace:
//! - `reserved + sold <= total`
//! - one active reservation per (user, SKU)
//! - unique idempotency keys

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already failed

use chrono::{DateTime, Utc};
use flashsale_core::ledger::{BatchSnapshot, InventoryLedger, LedgerError};
use flashsale_core::types::{
    AllocationCommit, ConfirmOutcome, IdempotencyKey, InventoryRecord, ProcessedKey,
    ReservationId, ReservationRecord, ReservationStatus, SkuId, UserId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct LedgerState {
    inventory: HashMap<SkuId, InventoryRecord>,
    reservations: HashMap<ReservationId, ReservationRecord>,
    reservation_keys: HashMap<IdempotencyKey, ReservationId>,
    active: HashMap<(UserId, SkuId), ReservationId>,
    processed: HashMap<IdempotencyKey, ProcessedKey>,
}

#[allow(clippy::panic)] // Simulated worker crash
fn injected_crash() -> ! {
    panic!("injected allocation crash");
}

#[derive(Debug, Default)]
struct Counters {
    snapshots: u64,
    commits: u64,
}

/// In-memory ledger for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use flashsale_testing::InMemoryLedger;
/// use flashsale_core::ledger::InventoryLedger;
/// use flashsale_core::types::SkuId;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = InMemoryLedger::new();
/// let sku = SkuId::new("sku-1");
/// ledger.create_inventory(&sku, 10).await?;
/// assert_eq!(ledger.inventory(&sku).await?.available(), 10);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    counters: Arc<Mutex<Counters>>,
    injected: Arc<Mutex<VecDeque<LedgerError>>>,
    panics: Arc<AtomicUsize>,
}

impl InMemoryLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `apply_allocation` calls fail with `error`, `times` times.
    pub fn fail_next_allocations(&self, times: usize, error: LedgerError) {
        let mut injected = self.injected.lock().unwrap();
        for _ in 0..times {
            injected.push_back(error.clone());
        }
    }

    /// Make the next `apply_allocation` calls panic, `times` times.
    ///
    /// Simulates a worker crash between snapshot and commit.
    pub fn panic_next_allocations(&self, times: usize) {
        self.panics.fetch_add(times, Ordering::SeqCst);
    }

    /// Number of `batch_snapshot` reads served
    #[must_use]
    pub fn snapshot_reads(&self) -> u64 {
        self.counters.lock().unwrap().snapshots
    }

    /// Number of successful `apply_allocation` commits
    #[must_use]
    pub fn allocation_commits(&self) -> u64 {
        self.counters.lock().unwrap().commits
    }

    /// All reservations of a SKU, in creation order
    #[must_use]
    pub fn reservations_for(&self, sku_id: &SkuId) -> Vec<ReservationRecord> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<_> = state
            .reservations
            .values()
            .filter(|r| &r.sku_id == sku_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows
    }

    /// Number of recorded processed keys
    #[must_use]
    pub fn processed_len(&self) -> usize {
        self.state.lock().unwrap().processed.len()
    }

    fn allocate(state: &mut LedgerState, commit: &AllocationCommit) -> Result<InventoryRecord, LedgerError> {
        let record = state
            .inventory
            .get(&commit.sku_id)
            .ok_or_else(|| LedgerError::UnknownSku(commit.sku_id.clone()))?;

        let reserved = u64::from(record.reserved) + commit.reservations.len() as u64;
        if reserved + u64::from(record.sold) > u64::from(record.total) {
            return Err(LedgerError::InvariantViolation {
                sku_id: commit.sku_id.clone(),
                detail: format!(
                    "reserved {reserved} + sold {} exceeds total {}",
                    record.sold, record.total
                ),
            });
        }

        let mut users = HashSet::new();
        let mut keys = HashSet::new();
        for reservation in &commit.reservations {
            if reservation.sku_id != commit.sku_id || reservation.status != ReservationStatus::Reserved {
                return Err(LedgerError::InvariantViolation {
                    sku_id: commit.sku_id.clone(),
                    detail: format!("malformed reservation {}", reservation.reservation_id),
                });
            }
            if state.reservation_keys.contains_key(&reservation.idempotency_key)
                || !keys.insert(reservation.idempotency_key.clone())
            {
                return Err(LedgerError::Conflict(format!(
                    "duplicate idempotency key {}",
                    reservation.idempotency_key
                )));
            }
            let pair = (reservation.user_id, reservation.sku_id.clone());
            if state.active.contains_key(&pair) || !users.insert(reservation.user_id) {
                return Err(LedgerError::Conflict(format!(
                    "user {} already holds {}",
                    reservation.user_id, reservation.sku_id
                )));
            }
        }

        let mut decided = HashSet::new();
        for processed in &commit.processed {
            if state.processed.contains_key(&processed.idempotency_key)
                || !decided.insert(processed.idempotency_key.clone())
            {
                return Err(LedgerError::Conflict(format!(
                    "key {} already processed",
                    processed.idempotency_key
                )));
            }
        }

        let reserved = u32::try_from(reserved).map_err(|_| LedgerError::InvariantViolation {
            sku_id: commit.sku_id.clone(),
            detail: "reserved counter overflow".to_string(),
        })?;

        for reservation in &commit.reservations {
            state
                .reservation_keys
                .insert(reservation.idempotency_key.clone(), reservation.reservation_id);
            state.active.insert(
                (reservation.user_id, reservation.sku_id.clone()),
                reservation.reservation_id,
            );
            state
                .reservations
                .insert(reservation.reservation_id, reservation.clone());
        }
        for processed in &commit.processed {
            state
                .processed
                .insert(processed.idempotency_key.clone(), processed.clone());
        }

        let record = state
            .inventory
            .get_mut(&commit.sku_id)
            .ok_or_else(|| LedgerError::UnknownSku(commit.sku_id.clone()))?;
        record.reserved = reserved;
        record.version += 1;
        Ok(record.clone())
    }

    fn release(
        state: &mut LedgerState,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationRecord>, LedgerError> {
        let record = state
            .inventory
            .get(sku_id)
            .ok_or_else(|| LedgerError::UnknownSku(sku_id.clone()))?;

        let releasable: Vec<ReservationId> = reservation_ids
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| {
                state
                    .reservations
                    .get(id)
                    .is_some_and(|r| &r.sku_id == sku_id && r.is_expired_at(now))
            })
            .collect();

        let count = u32::try_from(releasable.len()).unwrap_or(u32::MAX);
        if count > record.reserved {
            return Err(LedgerError::InvariantViolation {
                sku_id: sku_id.clone(),
                detail: format!("releasing {count} with only {} reserved", record.reserved),
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut released = Vec::with_capacity(releasable.len());
        for id in releasable {
            if let Some(row) = state.reservations.get_mut(&id) {
                row.status = ReservationStatus::Expired;
                state.active.remove(&(row.user_id, row.sku_id.clone()));
                released.push(row.clone());
            }
        }
        released.sort_by_key(|r| r.expires_at);

        if let Some(record) = state.inventory.get_mut(sku_id) {
            record.reserved -= count;
            record.version += 1;
        }
        Ok(released)
    }

    fn confirm(
        state: &mut LedgerState,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, LedgerError> {
        let row = state
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;

        match row.status {
            ReservationStatus::Confirmed => {
                return Ok(ConfirmOutcome {
                    reservation: row,
                    newly_confirmed: false,
                });
            }
            ReservationStatus::Expired | ReservationStatus::Failed => {
                return Err(LedgerError::ReservationExpired(reservation_id));
            }
            ReservationStatus::Reserved if row.expires_at <= now => {
                return Err(LedgerError::ReservationExpired(reservation_id));
            }
            ReservationStatus::Reserved => {}
        }

        let record = state
            .inventory
            .get_mut(&row.sku_id)
            .ok_or_else(|| LedgerError::UnknownSku(row.sku_id.clone()))?;
        if record.reserved == 0 || record.sold >= record.total {
            return Err(LedgerError::InvariantViolation {
                sku_id: row.sku_id.clone(),
                detail: format!("confirm with reserved {} sold {}", record.reserved, record.sold),
            });
        }
        record.reserved -= 1;
        record.sold += 1;
        record.version += 1;

        let row = state
            .reservations
            .get_mut(&reservation_id)
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?;
        row.status = ReservationStatus::Confirmed;
        Ok(ConfirmOutcome {
            reservation: row.clone(),
            newly_confirmed: true,
        })
    }
}

impl InventoryLedger for InMemoryLedger {
    fn create_inventory(
        &self,
        sku_id: &SkuId,
        total: u32,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.inventory.contains_key(&sku_id) {
                return Err(LedgerError::AlreadyExists(sku_id));
            }
            let record = InventoryRecord::new(sku_id.clone(), total);
            state.inventory.insert(sku_id, record.clone());
            Ok(record)
        })
    }

    fn inventory(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .inventory
                .get(&sku_id)
                .cloned()
                .ok_or(LedgerError::UnknownSku(sku_id))
        })
    }

    fn batch_snapshot(
        &self,
        sku_id: &SkuId,
        keys: &[IdempotencyKey],
        users: &[UserId],
    ) -> Pin<Box<dyn Future<Output = Result<BatchSnapshot, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        let keys = keys.to_vec();
        let users = users.to_vec();
        Box::pin(async move {
            self.counters.lock().unwrap().snapshots += 1;
            let state = self.state.lock().unwrap();
            let inventory = state
                .inventory
                .get(&sku_id)
                .cloned()
                .ok_or_else(|| LedgerError::UnknownSku(sku_id.clone()))?;
            let prior = keys
                .iter()
                .filter_map(|key| state.processed.get(key).map(|p| (key.clone(), p.clone())))
                .collect();
            let reserved_keys = keys
                .into_iter()
                .filter_map(|key| {
                    let id = state.reservation_keys.get(&key)?;
                    state.reservations.get(id).map(|r| (key, r.clone()))
                })
                .collect();
            let blocked_users = users
                .into_iter()
                .filter(|user| state.active.contains_key(&(*user, sku_id.clone())))
                .collect();
            Ok(BatchSnapshot {
                inventory,
                prior,
                reserved_keys,
                blocked_users,
            })
        })
    }

    fn apply_allocation(
        &self,
        commit: &AllocationCommit,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let commit = commit.clone();
        Box::pin(async move {
            let panic_now = self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if panic_now {
                injected_crash();
            }
            let injected = self.injected.lock().unwrap().pop_front();
            if let Some(error) = injected {
                return Err(error);
            }
            let record = Self::allocate(&mut self.state.lock().unwrap(), &commit)?;
            self.counters.lock().unwrap().commits += 1;
            Ok(record)
        })
    }

    fn apply_release(
        &self,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        let sku_id = sku_id.clone();
        let reservation_ids = reservation_ids.to_vec();
        Box::pin(async move {
            Self::release(&mut self.state.lock().unwrap(), &sku_id, &reservation_ids, now)
        })
    }

    fn apply_confirm(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ConfirmOutcome, LedgerError>> + Send + '_>> {
        Box::pin(async move { Self::confirm(&mut self.state.lock().unwrap(), reservation_id, now) })
    }

    fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .unwrap()
                .reservations
                .get(&reservation_id)
                .cloned())
        })
    }

    fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            let mut expired: Vec<_> = state
                .reservations
                .values()
                .filter(|r| r.is_expired_at(now))
                .cloned()
                .collect();
            expired.sort_by_key(|r| r.expires_at);
            expired.truncate(limit);
            Ok(expired)
        })
    }

    fn processed_outcome(
        &self,
        key: &IdempotencyKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProcessedKey>, LedgerError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.state.lock().unwrap().processed.get(&key).cloned()) })
    }

    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            let before = state.processed.len();
            state.processed.retain(|_, p| p.processed_at >= older_than);
            Ok((before - state.processed.len()) as u64)
        })
    }
}
