//! Inventory ledger on `PostgreSQL`.
//!
//! Each mutating operation is one transaction that first locks the SKU's
//! `inventory` row. Lock order is always inventory, then reservations, so
//! allocation, release and confirm never deadlock against each other.

use crate::{CHECK_VIOLATION, DEADLOCK_DETECTED, SERIALIZATION_FAILURE, UNIQUE_VIOLATION, sqlstate};
use chrono::{DateTime, Utc};
use flashsale_core::ledger::{BatchSnapshot, InventoryLedger, LedgerError};
use flashsale_core::types::{
    AllocationCommit, AllocationOutcome, ConfirmOutcome, IdempotencyKey, InventoryRecord,
    ProcessedKey, RequestId, ReservationId, ReservationRecord, ReservationStatus, SkuId, UserId,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Decode, Postgres, Row, Transaction, Type};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// `PostgreSQL`-backed [`InventoryLedger`].
///
/// Requires the schema from [`migrate`](crate::migrate).
///
/// # Example
///
/// ```no_run
/// use flashsale_postgres::PostgresLedger;
/// use flashsale_core::ledger::InventoryLedger;
/// use flashsale_core::types::SkuId;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = PostgresLedger::new(pool);
/// let record = ledger.create_inventory(&SkuId::new("console"), 100).await?;
/// assert_eq!(record.available(), 100);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a ledger on an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn create(&self, sku_id: &SkuId, total: u32) -> Result<InventoryRecord, LedgerError> {
        let total = to_i32(total)?;
        let row = sqlx::query(
            r"
            INSERT INTO inventory (sku_id, total)
            VALUES ($1, $2)
            RETURNING sku_id, total, reserved, sold, version
            ",
        )
        .bind(sku_id.as_str())
        .bind(total)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match classify(sku_id, e) {
            LedgerError::Conflict(_) => LedgerError::AlreadyExists(sku_id.clone()),
            other => other,
        })?;

        tracing::info!(sku = %sku_id, total, "Inventory created");
        inventory_from_row(&row)
    }

    async fn read_inventory(&self, sku_id: &SkuId) -> Result<InventoryRecord, LedgerError> {
        let row = sqlx::query(
            "SELECT sku_id, total, reserved, sold, version FROM inventory WHERE sku_id = $1",
        )
        .bind(sku_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error)?
        .ok_or_else(|| LedgerError::UnknownSku(sku_id.clone()))?;
        inventory_from_row(&row)
    }

    async fn snapshot(
        &self,
        sku_id: &SkuId,
        keys: &[IdempotencyKey],
        users: &[UserId],
    ) -> Result<BatchSnapshot, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(read_error)?;
        // All reads see the same committed state
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(read_error)?;

        let row = sqlx::query(
            "SELECT sku_id, total, reserved, sold, version FROM inventory WHERE sku_id = $1",
        )
        .bind(sku_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(read_error)?
        .ok_or_else(|| LedgerError::UnknownSku(sku_id.clone()))?;
        let inventory = inventory_from_row(&row)?;

        let key_list: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let prior_rows = sqlx::query(
            r"
            SELECT idempotency_key, request_id, user_id, sku_id, outcome,
                   reservation_id, expires_at, processed_at
            FROM processed_keys
            WHERE idempotency_key = ANY($1)
            ",
        )
        .bind(&key_list)
        .fetch_all(&mut *tx)
        .await
        .map_err(read_error)?;

        let reserved_rows = sqlx::query(
            r"
            SELECT reservation_id, request_id, user_id, sku_id, status,
                   idempotency_key, created_at, expires_at
            FROM reservations
            WHERE idempotency_key = ANY($1)
            ",
        )
        .bind(&key_list)
        .fetch_all(&mut *tx)
        .await
        .map_err(read_error)?;

        let user_list: Vec<Uuid> = users.iter().map(|u| *u.as_uuid()).collect();
        let blocked_rows = sqlx::query(
            r"
            SELECT DISTINCT user_id
            FROM reservations
            WHERE sku_id = $1
              AND user_id = ANY($2)
              AND status IN ('reserved', 'confirmed')
            ",
        )
        .bind(sku_id.as_str())
        .bind(&user_list)
        .fetch_all(&mut *tx)
        .await
        .map_err(read_error)?;

        tx.commit().await.map_err(read_error)?;

        let mut prior = HashMap::with_capacity(prior_rows.len());
        for row in &prior_rows {
            let processed = processed_from_row(row)?;
            prior.insert(processed.idempotency_key.clone(), processed);
        }
        let mut reserved_keys = HashMap::with_capacity(reserved_rows.len());
        for row in &reserved_rows {
            let reservation = reservation_from_row(row)?;
            reserved_keys.insert(reservation.idempotency_key.clone(), reservation);
        }
        let blocked_users = blocked_rows
            .iter()
            .map(|row| column::<Uuid>(row, "user_id").map(UserId::from_uuid))
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(BatchSnapshot {
            inventory,
            prior,
            reserved_keys,
            blocked_users,
        })
    }

    async fn allocate(&self, commit: &AllocationCommit) -> Result<InventoryRecord, LedgerError> {
        let sku_id = &commit.sku_id;
        if let Some(bad) = commit
            .reservations
            .iter()
            .find(|r| &r.sku_id != sku_id || r.status != ReservationStatus::Reserved)
        {
            return Err(LedgerError::InvariantViolation {
                sku_id: sku_id.clone(),
                detail: format!("malformed reservation {}", bad.reservation_id),
            });
        }
        let allocated = i32::try_from(commit.reservations.len()).map_err(|_| {
            LedgerError::InvariantViolation {
                sku_id: sku_id.clone(),
                detail: "batch larger than any stock".to_string(),
            }
        })?;

        let mut tx = self.pool.begin().await.map_err(|e| classify(sku_id, e))?;
        lock_inventory(&mut tx, sku_id).await?;

        let row = sqlx::query(
            r"
            UPDATE inventory
            SET reserved = reserved + $2, version = version + 1
            WHERE sku_id = $1
            RETURNING sku_id, total, reserved, sold, version
            ",
        )
        .bind(sku_id.as_str())
        .bind(allocated)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(sku_id, e))?;
        let record = inventory_from_row(&row)?;

        if !commit.reservations.is_empty() {
            insert_reservations(&mut tx, commit).await?;
        }
        if !commit.processed.is_empty() {
            insert_processed(&mut tx, commit).await?;
        }
        tx.commit().await.map_err(|e| classify(sku_id, e))?;

        tracing::debug!(
            sku = %sku_id,
            allocated,
            decided = commit.processed.len(),
            reserved = record.reserved,
            "Allocation committed"
        );
        Ok(record)
    }

    async fn release(
        &self,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationRecord>, LedgerError> {
        let ids: Vec<Uuid> = reservation_ids.iter().map(|id| *id.as_uuid()).collect();

        let mut tx = self.pool.begin().await.map_err(|e| classify(sku_id, e))?;
        lock_inventory(&mut tx, sku_id).await?;

        // Only rows still reserved and past their deadline move; the rest were
        // already released by another trigger or confirmed.
        let rows = sqlx::query(
            r"
            UPDATE reservations
            SET status = 'expired'
            WHERE reservation_id = ANY($1)
              AND sku_id = $2
              AND status = 'reserved'
              AND expires_at <= $3
            RETURNING reservation_id, request_id, user_id, sku_id, status,
                      idempotency_key, created_at, expires_at
            ",
        )
        .bind(&ids)
        .bind(sku_id.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| classify(sku_id, e))?;

        if rows.is_empty() {
            tx.rollback().await.map_err(|e| classify(sku_id, e))?;
            return Ok(Vec::new());
        }

        let count = i32::try_from(rows.len()).map_err(|_| LedgerError::InvariantViolation {
            sku_id: sku_id.clone(),
            detail: "release count overflow".to_string(),
        })?;
        sqlx::query(
            r"
            UPDATE inventory
            SET reserved = reserved - $2, version = version + 1
            WHERE sku_id = $1
            ",
        )
        .bind(sku_id.as_str())
        .bind(count)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(sku_id, e))?;
        tx.commit().await.map_err(|e| classify(sku_id, e))?;

        let mut released = rows
            .iter()
            .map(reservation_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        released.sort_by_key(|r| r.expires_at);
        Ok(released)
    }

    async fn confirm(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome, LedgerError> {
        // Unlocked read to learn the SKU, so the inventory row is locked first
        let sku_id = self
            .find_reservation(reservation_id)
            .await?
            .ok_or(LedgerError::ReservationNotFound(reservation_id))?
            .sku_id;

        let mut tx = self.pool.begin().await.map_err(|e| classify(&sku_id, e))?;
        lock_inventory(&mut tx, &sku_id).await?;

        let row = sqlx::query(
            r"
            SELECT reservation_id, request_id, user_id, sku_id, status,
                   idempotency_key, created_at, expires_at
            FROM reservations
            WHERE reservation_id = $1
            FOR UPDATE
            ",
        )
        .bind(reservation_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(&sku_id, e))?;
        let reservation = reservation_from_row(&row)?;

        match reservation.status {
            ReservationStatus::Confirmed => {
                return Ok(ConfirmOutcome {
                    reservation,
                    newly_confirmed: false,
                });
            }
            ReservationStatus::Expired | ReservationStatus::Failed => {
                return Err(LedgerError::ReservationExpired(reservation_id));
            }
            ReservationStatus::Reserved if reservation.expires_at <= now => {
                return Err(LedgerError::ReservationExpired(reservation_id));
            }
            ReservationStatus::Reserved => {}
        }

        sqlx::query(
            r"
            UPDATE inventory
            SET reserved = reserved - 1, sold = sold + 1, version = version + 1
            WHERE sku_id = $1
            ",
        )
        .bind(sku_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(&sku_id, e))?;

        let row = sqlx::query(
            r"
            UPDATE reservations
            SET status = 'confirmed'
            WHERE reservation_id = $1
            RETURNING reservation_id, request_id, user_id, sku_id, status,
                      idempotency_key, created_at, expires_at
            ",
        )
        .bind(reservation_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(&sku_id, e))?;
        tx.commit().await.map_err(|e| classify(&sku_id, e))?;

        Ok(ConfirmOutcome {
            reservation: reservation_from_row(&row)?,
            newly_confirmed: true,
        })
    }

    async fn find_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<ReservationRecord>, LedgerError> {
        sqlx::query(
            r"
            SELECT reservation_id, request_id, user_id, sku_id, status,
                   idempotency_key, created_at, expires_at
            FROM reservations
            WHERE reservation_id = $1
            ",
        )
        .bind(reservation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error)?
        .as_ref()
        .map(reservation_from_row)
        .transpose()
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ReservationRecord>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT reservation_id, request_id, user_id, sku_id, status,
                   idempotency_key, created_at, expires_at
            FROM reservations
            WHERE status = 'reserved' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(read_error)?;

        rows.iter().map(reservation_from_row).collect()
    }

    async fn outcome(&self, key: &IdempotencyKey) -> Result<Option<ProcessedKey>, LedgerError> {
        sqlx::query(
            r"
            SELECT idempotency_key, request_id, user_id, sku_id, outcome,
                   reservation_id, expires_at, processed_at
            FROM processed_keys
            WHERE idempotency_key = $1
            ",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error)?
        .as_ref()
        .map(processed_from_row)
        .transpose()
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM processed_keys WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(read_error)?;
        Ok(result.rows_affected())
    }
}

impl InventoryLedger for PostgresLedger {
    fn create_inventory(
        &self,
        sku_id: &SkuId,
        total: u32,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.create(&sku_id, total).await })
    }

    fn inventory(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move { self.read_inventory(&sku_id).await })
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
        Box::pin(async move { self.snapshot(&sku_id, &keys, &users).await })
    }

    fn apply_allocation(
        &self,
        commit: &AllocationCommit,
    ) -> Pin<Box<dyn Future<Output = Result<InventoryRecord, LedgerError>> + Send + '_>> {
        let commit = commit.clone();
        Box::pin(async move { self.allocate(&commit).await })
    }

    fn apply_release(
        &self,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        let reservation_ids = reservation_ids.to_vec();
        Box::pin(async move { self.release(&sku_id, &reservation_ids, now).await })
    }

    fn apply_confirm(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ConfirmOutcome, LedgerError>> + Send + '_>> {
        Box::pin(self.confirm(reservation_id, now))
    }

    fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(self.find_reservation(reservation_id))
    }

    fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationRecord>, LedgerError>> + Send + '_>>
    {
        Box::pin(self.expired(now, limit))
    }

    fn processed_outcome(
        &self,
        key: &IdempotencyKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<ProcessedKey>, LedgerError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move { self.outcome(&key).await })
    }

    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, LedgerError>> + Send + '_>> {
        Box::pin(self.purge(older_than))
    }
}

async fn lock_inventory(
    tx: &mut Transaction<'_, Postgres>,
    sku_id: &SkuId,
) -> Result<InventoryRecord, LedgerError> {
    let row = sqlx::query(
        r"
        SELECT sku_id, total, reserved, sold, version
        FROM inventory
        WHERE sku_id = $1
        FOR UPDATE
        ",
    )
    .bind(sku_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| classify(sku_id, e))?
    .ok_or_else(|| LedgerError::UnknownSku(sku_id.clone()))?;
    inventory_from_row(&row)
}

async fn insert_reservations(
    tx: &mut Transaction<'_, Postgres>,
    commit: &AllocationCommit,
) -> Result<(), LedgerError> {
    let rows = &commit.reservations;
    let ids: Vec<Uuid> = rows.iter().map(|r| *r.reservation_id.as_uuid()).collect();
    let request_ids: Vec<Uuid> = rows.iter().map(|r| *r.request_id.as_uuid()).collect();
    let user_ids: Vec<Uuid> = rows.iter().map(|r| *r.user_id.as_uuid()).collect();
    let skus: Vec<String> = rows.iter().map(|r| r.sku_id.as_str().to_string()).collect();
    let statuses: Vec<String> = rows.iter().map(|r| r.status.as_str().to_string()).collect();
    let keys: Vec<String> = rows
        .iter()
        .map(|r| r.idempotency_key.as_str().to_string())
        .collect();
    let created: Vec<DateTime<Utc>> = rows.iter().map(|r| r.created_at).collect();
    let expires: Vec<DateTime<Utc>> = rows.iter().map(|r| r.expires_at).collect();

    sqlx::query(
        r"
        INSERT INTO reservations (
            reservation_id, request_id, user_id, sku_id, status,
            idempotency_key, created_at, expires_at
        )
        SELECT * FROM UNNEST(
            $1::uuid[], $2::uuid[], $3::uuid[], $4::text[], $5::text[],
            $6::text[], $7::timestamptz[], $8::timestamptz[]
        )
        ",
    )
    .bind(&ids)
    .bind(&request_ids)
    .bind(&user_ids)
    .bind(&skus)
    .bind(&statuses)
    .bind(&keys)
    .bind(&created)
    .bind(&expires)
    .execute(&mut **tx)
    .await
    .map_err(|e| classify(&commit.sku_id, e))?;
    Ok(())
}

async fn insert_processed(
    tx: &mut Transaction<'_, Postgres>,
    commit: &AllocationCommit,
) -> Result<(), LedgerError> {
    let rows = &commit.processed;
    let keys: Vec<String> = rows
        .iter()
        .map(|p| p.idempotency_key.as_str().to_string())
        .collect();
    let request_ids: Vec<Uuid> = rows.iter().map(|p| *p.request_id.as_uuid()).collect();
    let user_ids: Vec<Uuid> = rows.iter().map(|p| *p.user_id.as_uuid()).collect();
    let skus: Vec<String> = rows.iter().map(|p| p.sku_id.as_str().to_string()).collect();
    let outcomes: Vec<String> = rows.iter().map(|p| p.outcome.as_str().to_string()).collect();
    let holds: Vec<(Option<Uuid>, Option<DateTime<Utc>>)> =
        rows.iter().map(|p| hold_columns(&p.outcome)).collect();
    let reservation_ids: Vec<Option<Uuid>> = holds.iter().map(|(id, _)| *id).collect();
    let expires: Vec<Option<DateTime<Utc>>> = holds.iter().map(|(_, at)| *at).collect();
    let processed_at: Vec<DateTime<Utc>> = rows.iter().map(|p| p.processed_at).collect();

    sqlx::query(
        r"
        INSERT INTO processed_keys (
            idempotency_key, request_id, user_id, sku_id, outcome,
            reservation_id, expires_at, processed_at
        )
        SELECT * FROM UNNEST(
            $1::text[], $2::uuid[], $3::uuid[], $4::text[], $5::text[],
            $6::uuid[], $7::timestamptz[], $8::timestamptz[]
        )
        ",
    )
    .bind(&keys)
    .bind(&request_ids)
    .bind(&user_ids)
    .bind(&skus)
    .bind(&outcomes)
    .bind(&reservation_ids)
    .bind(&expires)
    .bind(&processed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| classify(&commit.sku_id, e))?;
    Ok(())
}

/// Map a failed write to the ledger's error taxonomy.
fn classify(sku_id: &SkuId, error: sqlx::Error) -> LedgerError {
    match sqlstate(&error).as_deref() {
        Some(CHECK_VIOLATION) => {
            metrics::counter!("flashsale_ledger_constraint_rejections_total", "constraint" => "check")
                .increment(1);
            LedgerError::InvariantViolation {
                sku_id: sku_id.clone(),
                detail: error.to_string(),
            }
        }
        Some(UNIQUE_VIOLATION) => {
            metrics::counter!("flashsale_ledger_constraint_rejections_total", "constraint" => "unique")
                .increment(1);
            LedgerError::Conflict(error.to_string())
        }
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => LedgerError::Transaction(error.to_string()),
        _ => LedgerError::Database(error.to_string()),
    }
}

fn read_error(error: sqlx::Error) -> LedgerError {
    LedgerError::Database(error.to_string())
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, LedgerError>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| LedgerError::Database(format!("column {name}: {e}")))
}

fn to_i32(value: u32) -> Result<i32, LedgerError> {
    i32::try_from(value).map_err(|_| LedgerError::Database(format!("{value} exceeds INTEGER")))
}

fn to_u32(value: i32, name: &str) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::Database(format!("negative {name}: {value}")))
}

fn inventory_from_row(row: &PgRow) -> Result<InventoryRecord, LedgerError> {
    let version: i64 = column(row, "version")?;
    Ok(InventoryRecord {
        sku_id: SkuId::new(column::<String>(row, "sku_id")?),
        total: to_u32(column(row, "total")?, "total")?,
        reserved: to_u32(column(row, "reserved")?, "reserved")?,
        sold: to_u32(column(row, "sold")?, "sold")?,
        version: u64::try_from(version)
            .map_err(|_| LedgerError::Database(format!("negative version: {version}")))?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<ReservationRecord, LedgerError> {
    let status: String = column(row, "status")?;
    Ok(ReservationRecord {
        reservation_id: ReservationId::from_uuid(column(row, "reservation_id")?),
        request_id: RequestId::from_uuid(column(row, "request_id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        sku_id: SkuId::new(column::<String>(row, "sku_id")?),
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| LedgerError::Database(format!("unknown reservation status {status}")))?,
        idempotency_key: IdempotencyKey::new(column::<String>(row, "idempotency_key")?),
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
    })
}

fn processed_from_row(row: &PgRow) -> Result<ProcessedKey, LedgerError> {
    let label: String = column(row, "outcome")?;
    let reservation_id: Option<Uuid> = column(row, "reservation_id")?;
    let expires_at: Option<DateTime<Utc>> = column(row, "expires_at")?;
    let outcome = match (label.as_str(), reservation_id, expires_at) {
        ("reserved", Some(id), Some(expires_at)) => AllocationOutcome::Reserved {
            reservation_id: ReservationId::from_uuid(id),
            expires_at,
        },
        ("out_of_stock", _, _) => AllocationOutcome::OutOfStock,
        ("already_reserved", _, _) => AllocationOutcome::AlreadyReserved,
        _ => {
            return Err(LedgerError::Database(format!(
                "unreadable processed outcome {label}"
            )));
        }
    };

    Ok(ProcessedKey {
        idempotency_key: IdempotencyKey::new(column::<String>(row, "idempotency_key")?),
        request_id: RequestId::from_uuid(column(row, "request_id")?),
        user_id: UserId::from_uuid(column(row, "user_id")?),
        sku_id: SkuId::new(column::<String>(row, "sku_id")?),
        outcome,
        processed_at: column(row, "processed_at")?,
    })
}

const fn hold_columns(outcome: &AllocationOutcome) -> (Option<Uuid>, Option<DateTime<Utc>>) {
    match outcome {
        AllocationOutcome::Reserved {
            reservation_id,
            expires_at,
        } => (Some(*reservation_id.as_uuid()), Some(*expires_at)),
        AllocationOutcome::OutOfStock | AllocationOutcome::AlreadyReserved => (None, None),
    }
}
