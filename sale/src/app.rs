//! Backend wiring and sale lifecycle.

use crate::config::{Config, SaleSpec};
use flashsale_core::cache::CacheError;
use flashsale_core::environment::{Clock, SystemClock};
use flashsale_core::event::ReservationEvent;
use flashsale_core::event_bus::EventBusError;
use flashsale_core::ledger::LedgerError;
use flashsale_postgres::{PostgresIngestQueue, PostgresLedger};
use flashsale_redis::{RedisAvailabilityCache, RedisHoldTimers};
use flashsale_redpanda::RedpandaEventBus;
use flashsale_runtime::{Engine, EngineEnvironment, EngineError, ExpiryListener};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while bringing the service up.
#[derive(Error, Debug)]
pub enum AppError {
    /// `PostgreSQL` unreachable or rejected a query
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis unreachable
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Redpanda producer could not be created
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// Engine refused to start or open a sale
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Production backends: Postgres ledger and queue, Redis cache and timers,
/// Redpanda bus.
///
/// Migrations run on every connect; applied ones are skipped.
///
/// # Errors
///
/// Returns the first backend that cannot be reached.
pub async fn connect_backends(config: &Config) -> Result<EngineEnvironment, AppError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let pool = flashsale_postgres::connect(&config.database.url, config.database.max_connections)
        .await?;
    flashsale_postgres::migrate(&pool).await?;
    tracing::info!(max_connections = config.database.max_connections, "Ledger connected");

    let cache = RedisAvailabilityCache::new(&config.redis_url).await?;
    let timers = RedisHoldTimers::new(&config.redis_url, Arc::clone(&clock)).await?;
    tracing::info!("Redis connected");

    let bus = RedpandaEventBus::builder()
        .brokers(&config.redpanda.brokers)
        .compression(&config.redpanda.compression)
        .build()?;

    Ok(EngineEnvironment {
        ledger: Arc::new(PostgresLedger::new(pool.clone())),
        queue: Arc::new(PostgresIngestQueue::new(pool, config.engine.queue_ceiling)),
        cache: Arc::new(cache),
        timers: Arc::new(timers),
        bus: Arc::new(bus),
        clock,
    })
}

/// The allocation engine plus the sales it runs.
pub struct FlashSaleApp {
    engine: Engine,
    sales: Vec<SaleSpec>,
}

impl FlashSaleApp {
    /// App over an already-configured engine
    #[must_use]
    pub fn new(engine: Engine, sales: Vec<SaleSpec>) -> Self {
        Self {
            engine: engine.with_expiry_listener(Arc::new(ExpiryLog)),
            sales,
        }
    }

    /// Connect the production backends described by `config`.
    ///
    /// # Errors
    ///
    /// See [`connect_backends`].
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        let env = connect_backends(config).await?;
        let engine = Engine::new(env, config.engine_config());
        Ok(Self::new(engine, config.sales.clone()))
    }

    /// The running engine
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Start the engine and open every configured sale.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the engine cannot start or a sale cannot be
    /// opened or resumed.
    pub async fn start(&self) -> Result<(), AppError> {
        self.engine.start().await?;
        for sale in &self.sales {
            self.open_sale(sale).await?;
        }
        Ok(())
    }

    /// Create the sale, or resume it when its inventory already exists
    /// (service restart).
    ///
    /// # Errors
    ///
    /// Returns the engine error from `create_sale` / `resume_sale`.
    pub async fn open_sale(&self, sale: &SaleSpec) -> Result<(), AppError> {
        match self.engine.create_sale(&sale.sku_id, sale.total).await {
            Ok(_) => Ok(()),
            Err(EngineError::Ledger(LedgerError::AlreadyExists(_))) => {
                let record = self.engine.resume_sale(&sale.sku_id).await?;
                if record.total != sale.total {
                    tracing::warn!(
                        sku = %sale.sku_id,
                        configured = sale.total,
                        stored = record.total,
                        "Configured stock differs from ledger; ledger wins"
                    );
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain workers and stop background tasks
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl std::fmt::Debug for FlashSaleApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashSaleApp")
            .field("sales", &self.sales)
            .finish_non_exhaustive()
    }
}

/// Logs every released hold for operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryLog;

impl ExpiryListener for ExpiryLog {
    fn name(&self) -> &'static str {
        "expiry_log"
    }

    fn on_expired(
        &self,
        event: &ReservationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        if let ReservationEvent::Expired {
            reservation_id,
            user_id,
            sku_id,
            ..
        } = event
        {
            tracing::info!(
                sku = %sku_id,
                reservation_id = %reservation_id,
                user = %user_id,
                "Hold expired; unit back on sale"
            );
        }
        Box::pin(async { Ok(()) })
    }
}
