//! Pure batch planning.
//!
//! Given a drained batch and one ledger snapshot, decide every request in
//! arrival order and produce the single commit that records those decisions.
//! No I/O happens here, so the same inputs always yield the same decisions
//! (reservation ids aside).
//!
//! Per request, in order:
//! 1. a key with a recorded outcome is answered from it
//! 2. a key already decided earlier in this batch gets that decision
//! 3. a key that already names a reservation is answered with it, even after
//!    its processed row was purged
//! 4. a user holding (or just granted) the SKU gets `AlreadyReserved`
//! 5. otherwise a unit is allocated while the local counter is positive,
//!    else `OutOfStock`

use chrono::{DateTime, Utc};
use flashsale_core::ledger::BatchSnapshot;
use flashsale_core::types::{
    AllocationCommit, AllocationOutcome, IdempotencyKey, ProcessedKey, QueuedRequest, RequestId,
    ReservationId, ReservationRecord, ReservationStatus, SkuId, UserId,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOrigin {
    /// Decided by this batch and part of its commit
    Fresh,
    /// The same request was committed before (batch replay after a crash)
    Replayed,
    /// Another request already decided this key
    Duplicate,
}

/// Decision for one queued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Queue offset of the request
    pub offset: u64,
    /// The request being answered
    pub request_id: RequestId,
    /// Answer handed to the submitter
    pub outcome: AllocationOutcome,
    /// Where the answer came from
    pub origin: DecisionOrigin,
    /// Processed-key record backing the answer
    pub processed: ProcessedKey,
}

impl Decision {
    /// Whether the decision should be (re)announced on the event bus
    #[must_use]
    pub const fn is_announced(&self) -> bool {
        matches!(self.origin, DecisionOrigin::Fresh | DecisionOrigin::Replayed)
    }
}

/// Output of planning one batch.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// One decision per queued request, in arrival order
    pub decisions: Vec<Decision>,
    /// Everything the ledger must write atomically
    pub commit: AllocationCommit,
    /// Offset to acknowledge once the commit succeeded
    pub last_offset: Option<u64>,
}

impl BatchPlan {
    /// Units allocated by this batch
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.commit.allocated()
    }

    /// Decisions whose events must be published
    pub fn announced(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(|d| d.is_announced())
    }

    /// Reservations (new or replayed) whose hold timers should be armed
    pub fn held(&self) -> impl Iterator<Item = (ReservationId, DateTime<Utc>)> + '_ {
        self.announced().filter_map(|d| match d.outcome {
            AllocationOutcome::Reserved {
                reservation_id,
                expires_at,
            } => Some((reservation_id, expires_at)),
            AllocationOutcome::OutOfStock | AllocationOutcome::AlreadyReserved => None,
        })
    }
}

/// Plans batches for one SKU.
#[derive(Debug, Clone)]
pub struct BatchPlanner {
    hold: chrono::Duration,
}

impl BatchPlanner {
    /// Planner granting holds of `hold_duration`
    #[must_use]
    pub fn new(hold_duration: Duration) -> Self {
        Self {
            hold: chrono::Duration::from_std(hold_duration)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Decide `batch` against `snapshot` at `now`.
    #[must_use]
    pub fn plan(
        &self,
        sku_id: &SkuId,
        batch: &[QueuedRequest],
        snapshot: &BatchSnapshot,
        now: DateTime<Utc>,
    ) -> BatchPlan {
        let mut available = snapshot.inventory.available();
        let mut holders: HashSet<UserId> = snapshot.blocked_users.clone();
        let mut decided: HashMap<IdempotencyKey, ProcessedKey> = HashMap::new();
        let mut commit = AllocationCommit::new(sku_id.clone());
        let mut decisions = Vec::with_capacity(batch.len());
        let expires_at = now + self.hold;

        for entry in batch {
            let request = &entry.request;

            let key = &request.idempotency_key;
            let earlier = snapshot.prior.get(key).or_else(|| decided.get(key));
            if let Some(earlier) = earlier {
                let origin = if earlier.request_id == request.request_id {
                    DecisionOrigin::Replayed
                } else {
                    DecisionOrigin::Duplicate
                };
                decisions.push(Decision {
                    offset: entry.offset,
                    request_id: request.request_id,
                    outcome: earlier.outcome.clone(),
                    origin,
                    processed: earlier.clone(),
                });
                continue;
            }

            // Processed row purged, reservation still on record
            if let Some(reservation) = snapshot.reserved_keys.get(key) {
                let earlier = ProcessedKey::from_reservation(reservation);
                decisions.push(Decision {
                    offset: entry.offset,
                    request_id: request.request_id,
                    outcome: earlier.outcome.clone(),
                    origin: DecisionOrigin::Duplicate,
                    processed: earlier.clone(),
                });
                decided.insert(key.clone(), earlier);
                continue;
            }

            let outcome = if holders.contains(&request.user_id) {
                AllocationOutcome::AlreadyReserved
            } else if available == 0 {
                AllocationOutcome::OutOfStock
            } else {
                available -= 1;
                holders.insert(request.user_id);
                let reservation_id = ReservationId::new();
                commit.reservations.push(ReservationRecord {
                    reservation_id,
                    request_id: request.request_id,
                    user_id: request.user_id,
                    sku_id: sku_id.clone(),
                    status: ReservationStatus::Reserved,
                    idempotency_key: request.idempotency_key.clone(),
                    created_at: now,
                    expires_at,
                });
                AllocationOutcome::Reserved {
                    reservation_id,
                    expires_at,
                }
            };

            let processed = ProcessedKey {
                idempotency_key: request.idempotency_key.clone(),
                request_id: request.request_id,
                user_id: request.user_id,
                sku_id: sku_id.clone(),
                outcome: outcome.clone(),
                processed_at: now,
            };
            commit.processed.push(processed.clone());
            decided.insert(request.idempotency_key.clone(), processed.clone());
            decisions.push(Decision {
                offset: entry.offset,
                request_id: request.request_id,
                outcome,
                origin: DecisionOrigin::Fresh,
                processed,
            });
        }

        BatchPlan {
            decisions,
            commit,
            last_offset: batch.last().map(|entry| entry.offset),
        }
    }
}
