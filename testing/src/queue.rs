//! In-memory ingest queue.
//!
//! Each SKU gets a log of entries plus two cursors: `delivered` (next entry to
//! hand out) and `acked` (everything at or below is done). `rewind` moves
//! `delivered` back to `acked`, which is what a restarted allocator sees.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flashsale_core::queue::{IngestQueue, QueueError};
use flashsale_core::types::{AllocationRequest, QueuedRequest, SkuId};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Partition {
    entries: VecDeque<QueuedRequest>,
    next_offset: u64,
    delivered: u64,
    acked: u64,
}

impl Partition {
    fn depth(&self) -> u64 {
        self.entries.len() as u64
    }

    fn take(&mut self, max_count: usize) -> Vec<QueuedRequest> {
        let batch: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.offset > self.delivered)
            .take(max_count)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            self.delivered = last.offset;
        }
        batch
    }
}

#[derive(Debug, Default)]
struct Shared {
    partitions: Mutex<HashMap<SkuId, Partition>>,
    notify: Notify,
}

/// In-memory per-SKU queue with a depth ceiling.
///
/// Offsets start at 1 so that `acked == 0` means nothing was acknowledged.
#[derive(Clone, Debug)]
pub struct InMemoryIngestQueue {
    shared: Arc<Shared>,
    ceiling: u64,
}

impl InMemoryIngestQueue {
    /// Queue that rejects enqueues once a SKU holds `ceiling` unacknowledged entries
    #[must_use]
    pub fn new(ceiling: u64) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            ceiling,
        }
    }

    /// Last acknowledged offset for a SKU
    #[must_use]
    pub fn acked_offset(&self, sku_id: &SkuId) -> u64 {
        self.shared
            .partitions
            .lock()
            .unwrap()
            .get(sku_id)
            .map_or(0, |p| p.acked)
    }

    fn try_take(&self, sku_id: &SkuId, max_count: usize) -> Vec<QueuedRequest> {
        self.shared
            .partitions
            .lock()
            .unwrap()
            .get_mut(sku_id)
            .map(|p| p.take(max_count))
            .unwrap_or_default()
    }
}

impl Default for InMemoryIngestQueue {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

impl IngestQueue for InMemoryIngestQueue {
    fn enqueue(
        &self,
        request: AllocationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>> {
        Box::pin(async move {
            let offset = {
                let mut partitions = self.shared.partitions.lock().unwrap();
                let partition = partitions.entry(request.sku_id.clone()).or_default();
                let depth = partition.depth();
                if depth >= self.ceiling {
                    return Err(QueueError::QueueFull {
                        sku_id: request.sku_id,
                        depth,
                    });
                }
                partition.next_offset += 1;
                let offset = partition.next_offset;
                partition.entries.push_back(QueuedRequest { offset, request });
                offset
            };
            self.shared.notify.notify_waiters();
            Ok(offset)
        })
    }

    fn dequeue_batch(
        &self,
        sku_id: &SkuId,
        max_count: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedRequest>, QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + max_wait;
            let mut batch = Vec::new();
            loop {
                // Register interest before checking so a concurrent enqueue is not missed
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                batch.extend(self.try_take(&sku_id, max_count - batch.len()));
                if batch.len() >= max_count {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    batch.extend(self.try_take(&sku_id, max_count - batch.len()));
                    break;
                }
            }
            Ok(batch)
        })
    }

    fn ack(
        &self,
        sku_id: &SkuId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            if let Some(partition) = self.shared.partitions.lock().unwrap().get_mut(&sku_id) {
                if offset > partition.acked {
                    partition.acked = offset;
                    partition.delivered = partition.delivered.max(offset);
                    while partition.entries.front().is_some_and(|e| e.offset <= offset) {
                        partition.entries.pop_front();
                    }
                }
            }
            Ok(())
        })
    }

    fn rewind(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            if let Some(partition) = self.shared.partitions.lock().unwrap().get_mut(&sku_id) {
                partition.delivered = partition.acked;
            }
            self.shared.notify.notify_waiters();
            Ok(())
        })
    }

    fn depth(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            Ok(self
                .shared
                .partitions
                .lock()
                .unwrap()
                .get(&sku_id)
                .map_or(0, Partition::depth))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashsale_core::types::{IdempotencyKey, RequestId, UserId};

    fn request(sku: &str, key: &str) -> AllocationRequest {
        AllocationRequest {
            request_id: RequestId::new(),
            user_id: UserId::new(),
            sku_id: SkuId::new(sku),
            idempotency_key: IdempotencyKey::new(key),
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_in_arrival_order_and_respects_max_count() {
        let queue = InMemoryIngestQueue::default();
        let sku = SkuId::new("a");
        for i in 0..5 {
            queue.enqueue(request("a", &format!("k{i}"))).await.unwrap();
        }

        let batch = queue
            .dequeue_batch(&sku, 3, Duration::from_millis(5))
            .await
            .unwrap();
        let offsets: Vec<_> = batch.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);

        let rest = queue
            .dequeue_batch(&sku, 10, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].request.idempotency_key.as_str(), "k3");
    }

    #[tokio::test]
    async fn rewind_redelivers_unacknowledged_entries() {
        let queue = InMemoryIngestQueue::default();
        let sku = SkuId::new("a");
        for i in 0..4 {
            queue.enqueue(request("a", &format!("k{i}"))).await.unwrap();
        }

        let batch = queue.dequeue_batch(&sku, 2, Duration::ZERO).await.unwrap();
        queue.ack(&sku, batch[1].offset).await.unwrap();
        let _lost = queue.dequeue_batch(&sku, 2, Duration::ZERO).await.unwrap();

        queue.rewind(&sku).await.unwrap();
        let replay = queue.dequeue_batch(&sku, 10, Duration::ZERO).await.unwrap();
        let offsets: Vec<_> = replay.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert_eq!(queue.depth(&sku).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejects_when_ceiling_reached() {
        let queue = InMemoryIngestQueue::new(2);
        queue.enqueue(request("a", "k0")).await.unwrap();
        queue.enqueue(request("a", "k1")).await.unwrap();

        let err = queue.enqueue(request("a", "k2")).await.unwrap_err();
        assert!(err.is_backpressure());

        // Other SKUs have their own depth
        queue.enqueue(request("b", "k0")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_returns_after_max_wait() {
        let queue = InMemoryIngestQueue::default();
        let batch = queue
            .dequeue_batch(&SkuId::new("a"), 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let queue = InMemoryIngestQueue::default();
        let sku = SkuId::new("a");

        let consumer = {
            let queue = queue.clone();
            let sku = sku.clone();
            tokio::spawn(async move {
                queue
                    .dequeue_batch(&sku, 1, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(request("a", "k0")).await.unwrap();

        let batch = consumer.await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
