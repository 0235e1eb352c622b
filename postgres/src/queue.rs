//! Durable ingest queue on `PostgreSQL`.
//!
//! Requests are rows of `allocation_requests`; the `BIGSERIAL` column is the
//! offset. Enqueues for one SKU take a transaction-scoped advisory lock, so
//! offsets become visible in the order they were assigned and a reader never
//! skips over a slower concurrent insert.
//!
//! The durable position is `queue_offsets.acked_offset`. The delivery cursor
//! lives in memory: it only matters to the single worker that owns the SKU,
//! and a restart rewinds it to the acknowledged offset anyway.

use chrono::{DateTime, Utc};
use flashsale_core::queue::{IngestQueue, QueueError};
use flashsale_core::types::{
    AllocationRequest, IdempotencyKey, QueuedRequest, RequestId, SkuId, UserId,
};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// `PostgreSQL`-backed [`IngestQueue`].
///
/// # Example
///
/// ```no_run
/// use flashsale_postgres::PostgresIngestQueue;
/// use std::time::Duration;
///
/// # fn example(pool: sqlx::PgPool) {
/// let queue = PostgresIngestQueue::new(pool, 50_000)
///     .with_poll_interval(Duration::from_millis(2));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresIngestQueue {
    pool: PgPool,
    ceiling: u64,
    poll_interval: Duration,
    delivered: Arc<Mutex<HashMap<SkuId, u64>>>,
}

impl PostgresIngestQueue {
    /// Queue rejecting enqueues once a SKU holds `ceiling` unacknowledged rows
    #[must_use]
    pub fn new(pool: PgPool, ceiling: u64) -> Self {
        Self {
            pool,
            ceiling,
            poll_interval: DEFAULT_POLL_INTERVAL,
            delivered: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// How often `dequeue_batch` polls while waiting for rows
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn push(&self, request: AllocationRequest) -> Result<u64, QueueError> {
        let ceiling = i64::try_from(self.ceiling).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Serializes enqueues per SKU until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(request.sku_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let depth: i64 = sqlx::query_scalar("SELECT count(*) FROM allocation_requests WHERE sku_id = $1")
            .bind(request.sku_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        if depth >= ceiling {
            return Err(QueueError::QueueFull {
                sku_id: request.sku_id,
                depth: u64::try_from(depth).unwrap_or(0),
            });
        }

        let offset: i64 = sqlx::query_scalar(
            r"
            INSERT INTO allocation_requests (sku_id, request_id, user_id, idempotency_key, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING queue_offset
            ",
        )
        .bind(request.sku_id.as_str())
        .bind(request.request_id.as_uuid())
        .bind(request.user_id.as_uuid())
        .bind(request.idempotency_key.as_str())
        .bind(request.enqueued_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        to_offset(offset)
    }

    async fn acked(&self, sku_id: &SkuId) -> Result<u64, QueueError> {
        let acked: Option<i64> =
            sqlx::query_scalar("SELECT acked_offset FROM queue_offsets WHERE sku_id = $1")
                .bind(sku_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        acked.map_or(Ok(0), to_offset)
    }

    async fn cursor(&self, sku_id: &SkuId) -> Result<u64, QueueError> {
        if let Some(cursor) = self.lock_delivered()?.get(sku_id) {
            return Ok(*cursor);
        }
        let acked = self.acked(sku_id).await?;
        Ok(*self.lock_delivered()?.entry(sku_id.clone()).or_insert(acked))
    }

    fn set_cursor(&self, sku_id: &SkuId, offset: u64) -> Result<(), QueueError> {
        let mut delivered = self.lock_delivered()?;
        let cursor = delivered.entry(sku_id.clone()).or_insert(0);
        *cursor = (*cursor).max(offset);
        Ok(())
    }

    fn lock_delivered(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SkuId, u64>>, QueueError> {
        self.delivered
            .lock()
            .map_err(|_| QueueError::Storage("delivery cursor lock poisoned".to_string()))
    }

    async fn fetch(
        &self,
        sku_id: &SkuId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<QueuedRequest>, QueueError> {
        let rows = sqlx::query(
            r"
            SELECT queue_offset, sku_id, request_id, user_id, idempotency_key, enqueued_at
            FROM allocation_requests
            WHERE sku_id = $1 AND queue_offset > $2
            ORDER BY queue_offset ASC
            LIMIT $3
            ",
        )
        .bind(sku_id.as_str())
        .bind(i64::try_from(after).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter().map(queued_from_row).collect()
    }

    async fn take(
        &self,
        sku_id: &SkuId,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueuedRequest>, QueueError> {
        let deadline = Instant::now() + max_wait;
        let mut after = self.cursor(sku_id).await?;
        let mut batch = Vec::new();

        loop {
            let fetched = self.fetch(sku_id, after, max_count - batch.len()).await?;
            if let Some(last) = fetched.last() {
                after = last.offset;
            }
            batch.extend(fetched);

            let now = Instant::now();
            if batch.len() >= max_count || now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        self.set_cursor(sku_id, after)?;
        Ok(batch)
    }

    async fn commit_ack(&self, sku_id: &SkuId, offset: u64) -> Result<(), QueueError> {
        let offset_db = i64::try_from(offset)
            .map_err(|_| QueueError::Storage(format!("offset {offset} out of range")))?;
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            r"
            INSERT INTO queue_offsets (sku_id, acked_offset)
            VALUES ($1, $2)
            ON CONFLICT (sku_id)
            DO UPDATE SET acked_offset = GREATEST(queue_offsets.acked_offset, EXCLUDED.acked_offset)
            ",
        )
        .bind(sku_id.as_str())
        .bind(offset_db)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        sqlx::query("DELETE FROM allocation_requests WHERE sku_id = $1 AND queue_offset <= $2")
            .bind(sku_id.as_str())
            .bind(offset_db)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        self.set_cursor(sku_id, offset)
    }

    async fn reset(&self, sku_id: &SkuId) -> Result<(), QueueError> {
        let acked = self.acked(sku_id).await?;
        self.lock_delivered()?.insert(sku_id.clone(), acked);
        tracing::info!(sku = %sku_id, acked, "Queue rewound to last acknowledged offset");
        Ok(())
    }

    async fn count(&self, sku_id: &SkuId) -> Result<u64, QueueError> {
        let depth: i64 =
            sqlx::query_scalar("SELECT count(*) FROM allocation_requests WHERE sku_id = $1")
                .bind(sku_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
        to_offset(depth)
    }
}

impl IngestQueue for PostgresIngestQueue {
    fn enqueue(
        &self,
        request: AllocationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>> {
        Box::pin(self.push(request))
    }

    fn dequeue_batch(
        &self,
        sku_id: &SkuId,
        max_count: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedRequest>, QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.take(&sku_id, max_count, max_wait).await })
    }

    fn ack(
        &self,
        sku_id: &SkuId,
        offset: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.commit_ack(&sku_id, offset).await })
    }

    fn rewind(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.reset(&sku_id).await })
    }

    fn depth(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, QueueError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.count(&sku_id).await })
    }
}

fn storage(error: sqlx::Error) -> QueueError {
    QueueError::Storage(error.to_string())
}

fn to_offset(value: i64) -> Result<u64, QueueError> {
    u64::try_from(value).map_err(|_| QueueError::Storage(format!("negative offset {value}")))
}

fn queued_from_row(row: &PgRow) -> Result<QueuedRequest, QueueError> {
    let offset: i64 = row.try_get("queue_offset").map_err(storage)?;
    let request_id: Uuid = row.try_get("request_id").map_err(storage)?;
    let user_id: Uuid = row.try_get("user_id").map_err(storage)?;
    let sku_id: String = row.try_get("sku_id").map_err(storage)?;
    let key: String = row.try_get("idempotency_key").map_err(storage)?;
    let enqueued_at: DateTime<Utc> = row.try_get("enqueued_at").map_err(storage)?;

    Ok(QueuedRequest {
        offset: to_offset(offset)?,
        request: AllocationRequest {
            request_id: RequestId::from_uuid(request_id),
            user_id: UserId::from_uuid(user_id),
            sku_id: SkuId::new(sku_id),
            idempotency_key: IdempotencyKey::new(key),
            enqueued_at,
        },
    })
}
