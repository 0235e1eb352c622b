//! Request status tracking for polling and `await_outcome`.

use chrono::{DateTime, Utc};
use flashsale_core::types::{AllocationOutcome, RequestId, SkuId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// What is known about a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// Never submitted here, or purged after retention
    Unknown,
    /// Queued, not yet decided
    Pending,
    /// Terminal outcome
    Decided(AllocationOutcome),
    /// The SKU's allocator halted before deciding; the request never will be
    Halted(SkuId),
}

impl RequestStatus {
    /// Whether the status can still change
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    sku_id: SkuId,
    status: RequestStatus,
    updated_at: DateTime<Utc>,
}

/// Shared request-id → status map with wake-ups on decisions.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    entries: Arc<RwLock<HashMap<RequestId, Entry>>>,
    decided: Arc<Notify>,
}

impl StatusBoard {
    /// Create an empty board
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is queued.
    ///
    /// Never overwrites a decision recorded in the meantime.
    pub fn mark_pending(&self, sku_id: &SkuId, request_id: RequestId, now: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.entry(request_id).or_insert_with(|| Entry {
                sku_id: sku_id.clone(),
                status: RequestStatus::Pending,
                updated_at: now,
            });
        }
    }

    /// Forget a request that never made it into the queue
    pub fn forget(&self, request_id: RequestId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&request_id);
        }
    }

    /// Record decisions for `sku_id` and wake every waiter
    pub fn record<'a>(
        &self,
        sku_id: &SkuId,
        decisions: impl IntoIterator<Item = (RequestId, &'a AllocationOutcome)>,
        now: DateTime<Utc>,
    ) {
        if let Ok(mut entries) = self.entries.write() {
            for (request_id, outcome) in decisions {
                entries.insert(
                    request_id,
                    Entry {
                        sku_id: sku_id.clone(),
                        status: RequestStatus::Decided(outcome.clone()),
                        updated_at: now,
                    },
                );
            }
        }
        self.decided.notify_waiters();
    }

    /// Close every pending request of a halted SKU and wake every waiter.
    ///
    /// Returns how many requests were closed.
    pub fn halt_pending(&self, sku_id: &SkuId, now: DateTime<Utc>) -> usize {
        let halted = self.entries.write().map_or(0, |mut entries| {
            let mut halted = 0;
            for entry in entries
                .values_mut()
                .filter(|entry| &entry.sku_id == sku_id && entry.status.is_pending())
            {
                entry.status = RequestStatus::Halted(sku_id.clone());
                entry.updated_at = now;
                halted += 1;
            }
            halted
        });
        self.decided.notify_waiters();
        halted
    }

    /// Current status of a request
    #[must_use]
    pub fn get(&self, request_id: RequestId) -> RequestStatus {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&request_id).map(|entry| entry.status.clone()))
            .unwrap_or(RequestStatus::Unknown)
    }

    /// Wait until the request leaves `Pending` or `timeout` elapses.
    ///
    /// Returns the last status seen: still `Pending` on timeout.
    pub async fn wait(&self, request_id: RequestId, timeout: Duration) -> RequestStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.decided.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.get(request_id);
            if !status.is_pending() {
                return status;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(request_id);
            }
        }
    }

    /// Drop settled entries last touched before `older_than`; returns how many
    pub fn purge(&self, older_than: DateTime<Utc>) -> usize {
        self.entries.write().map_or(0, |mut entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.status.is_pending() || entry.updated_at >= older_than);
            before - entries.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sku() -> SkuId {
        SkuId::new("console")
    }

    #[tokio::test]
    async fn pending_then_decided() {
        let board = StatusBoard::new();
        let id = RequestId::new();
        let now = Utc::now();
        assert_eq!(board.get(id), RequestStatus::Unknown);

        board.mark_pending(&sku(), id, now);
        assert_eq!(board.get(id), RequestStatus::Pending);

        board.record(&sku(), [(id, &AllocationOutcome::OutOfStock)], now);
        assert_eq!(
            board.get(id),
            RequestStatus::Decided(AllocationOutcome::OutOfStock)
        );

        // A late mark_pending does not hide the decision
        board.mark_pending(&sku(), id, now);
        assert!(matches!(board.get(id), RequestStatus::Decided(_)));
    }

    #[tokio::test]
    async fn wait_wakes_on_record() {
        let board = StatusBoard::new();
        let id = RequestId::new();
        board.mark_pending(&sku(), id, Utc::now());

        let waiter = {
            let board = board.clone();
            tokio::spawn(async move { board.wait(id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        board.record(&sku(), [(id, &AllocationOutcome::AlreadyReserved)], Utc::now());

        assert_eq!(
            waiter.await.unwrap(),
            RequestStatus::Decided(AllocationOutcome::AlreadyReserved)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_while_pending() {
        let board = StatusBoard::new();
        let id = RequestId::new();
        board.mark_pending(&sku(), id, Utc::now());
        assert_eq!(
            board.wait(id, Duration::from_millis(50)).await,
            RequestStatus::Pending
        );
    }

    #[test]
    fn purge_keeps_pending_entries() {
        let board = StatusBoard::new();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);
        let pending = RequestId::new();
        let decided = RequestId::new();
        board.mark_pending(&sku(), pending, old);
        board.record(&sku(), [(decided, &AllocationOutcome::OutOfStock)], old);

        assert_eq!(board.purge(now), 1);
        assert_eq!(board.get(pending), RequestStatus::Pending);
        assert_eq!(board.get(decided), RequestStatus::Unknown);
    }

    #[tokio::test]
    async fn halting_a_sku_closes_its_pending_requests_only() {
        let board = StatusBoard::new();
        let now = Utc::now();
        let stuck = RequestId::new();
        let elsewhere = RequestId::new();
        let decided = RequestId::new();
        board.mark_pending(&sku(), stuck, now);
        board.mark_pending(&SkuId::new("headphones"), elsewhere, now);
        board.record(&sku(), [(decided, &AllocationOutcome::OutOfStock)], now);

        let waiter = {
            let board = board.clone();
            tokio::spawn(async move { board.wait(stuck, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(board.halt_pending(&sku(), now), 1);
        assert_eq!(waiter.await.unwrap(), RequestStatus::Halted(sku()));
        assert_eq!(board.get(elsewhere), RequestStatus::Pending);
        assert!(matches!(board.get(decided), RequestStatus::Decided(_)));

        // Halted entries age out like decided ones
        assert_eq!(board.purge(now + chrono::Duration::seconds(1)), 2);
        assert_eq!(board.get(stuck), RequestStatus::Unknown);
    }
}
