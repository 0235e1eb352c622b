//! Per-SKU ordered ingest queue.
//!
//! Requests are appended in arrival order and delivered to the SKU's allocator
//! in that order. Delivery is at-least-once: entries stay in the queue until the
//! allocator acknowledges them after its ledger commit, and a restarted
//! allocator sees every unacknowledged entry again.

use crate::types::{AllocationRequest, QueuedRequest, SkuId};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Depth for the SKU reached the configured ceiling
    #[error("Queue full for SKU {sku_id} (depth {depth})")]
    QueueFull {
        /// Rejected SKU
        sku_id: SkuId,
        /// Depth at rejection
        depth: u64,
    },

    /// The queue is shutting down
    #[error("Queue closed")]
    Closed,

    /// Storage failure
    #[error("Queue storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// Whether the caller should simply try again later
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}

/// Ordered, durable request channel keyed by SKU.
pub trait IngestQueue: Send + Sync {
    /// Append a request to its SKU's queue and return the assigned offset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::QueueFull`] when the SKU's depth is at the ceiling.
    fn enqueue(
        &self,
        request: AllocationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>>;

    /// Deliver up to `max_count` requests in arrival order.
    ///
    /// Waits up to `max_wait` for the first entry and then keeps filling until
    /// either bound is hit. May return an empty batch.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    fn dequeue_batch(
        &self,
        sku_id: &SkuId,
        max_count: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedRequest>, QueueError>> + Send + '_>>;

    /// Mark every entry up to and including `offset` as done.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    fn ack(
        &self,
        sku_id: &SkuId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Make every unacknowledged entry deliverable again, in original order.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    fn rewind(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Number of unacknowledged entries.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    fn depth(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>>;
}
