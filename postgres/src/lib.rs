//! `PostgreSQL` backends for the flash-sale allocation engine.
//!
//! This crate provides the durable implementations of two `flashsale-core`
//! traits on sqlx:
//!
//! - [`PostgresLedger`]: the [`InventoryLedger`](flashsale_core::ledger::InventoryLedger).
//!   The stock invariant, the one-hold-per-user rule and key uniqueness are
//!   schema constraints, so a buggy caller gets an error instead of an oversell.
//! - [`PostgresIngestQueue`]: the [`IngestQueue`](flashsale_core::queue::IngestQueue)
//!   as an append-only table plus a per-SKU acknowledged offset.
//!
//! # Example
//!
//! ```ignore
//! use flashsale_postgres::{PostgresIngestQueue, PostgresLedger};
//!
//! let pool = flashsale_postgres::connect("postgres://localhost/flashsale", 20).await?;
//! flashsale_postgres::migrate(&pool).await?;
//!
//! let ledger = PostgresLedger::new(pool.clone());
//! let queue = PostgresIngestQueue::new(pool, 50_000);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Inventory ledger
pub mod ledger;

/// Durable ingest queue
pub mod queue;

pub use ledger::PostgresLedger;
pub use queue::PostgresIngestQueue;

// SQLSTATE codes the ledger reacts to
pub(crate) const CHECK_VIOLATION: &str = "23514";
pub(crate) const UNIQUE_VIOLATION: &str = "23505";
pub(crate) const SERIALIZATION_FAILURE: &str = "40001";
pub(crate) const DEADLOCK_DETECTED: &str = "40P01";

/// Open a connection pool.
///
/// # Errors
///
/// Returns the sqlx error if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Apply the bundled schema migrations.
///
/// Safe to call on every start; applied migrations are skipped.
///
/// # Errors
///
/// Returns the migration error if a script fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// SQLSTATE of a database error, if the error came from the server.
pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}
