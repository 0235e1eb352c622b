//! Engine façade: sale setup, submission, reads, confirmation and lifecycle.
//!
//! The engine owns one supervised [`SkuWorker`] per SKU plus the background
//! expiry tasks. Callers never touch the ledger directly; every write goes
//! through a worker (allocation), the release service (expiry) or
//! [`Engine::confirm`].

use crate::availability::AvailabilityView;
use crate::circuit_breaker::{CircuitBreaker, State};
use crate::config::EngineConfig;
use crate::environment::EngineEnvironment;
use crate::error::{ConfirmError, EngineError};
use crate::expiry::{
    ExpiryListener, ExpiryReactor, ExpirySweeper, HoldWatcher, ReleaseService, SweepReport,
};
use crate::health::{HealthBoard, WorkerState};
use crate::metrics::{AllocatorMetrics, ExpiryMetrics};
use crate::processed::ProcessedSet;
use crate::publisher::EventPublisher;
use crate::status::{RequestStatus, StatusBoard};
use crate::worker::{SkuWorker, WorkerContext, WorkerExit};
use crate::HealthReport;
use anyhow::Context;
use flashsale_core::event::ReservationEvent;
use flashsale_core::ledger::LedgerError;
use flashsale_core::queue::QueueError;
use flashsale_core::types::{
    AllocationOutcome, AllocationRequest, Availability, IdempotencyKey, InventoryRecord,
    ProcessedKey, RequestId, ReservationId, ReservationRecord, SkuId, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// The flash-sale allocation engine.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(env, EngineConfig::default());
/// engine.start().await?;
/// engine.create_sale(&SkuId::new("console"), 10).await?;
///
/// let request_id = engine
///     .submit(user_id, &SkuId::new("console"), 1, IdempotencyKey::new("order-1"))
///     .await?;
/// let outcome = engine.await_outcome(request_id, Duration::from_secs(1)).await?;
/// ```
pub struct Engine {
    ctx: WorkerContext,
    availability: AvailabilityView,
    release: ReleaseService,
    listeners: Vec<Arc<dyn ExpiryListener>>,
    breakers: RwLock<HashMap<SkuId, CircuitBreaker>>,
    workers: Mutex<HashMap<SkuId, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Engine {
    /// Engine over `env`. Nothing runs until [`start`](Self::start) and
    /// [`create_sale`](Self::create_sale) / [`resume_sale`](Self::resume_sale).
    #[must_use]
    pub fn new(env: EngineEnvironment, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let publisher = EventPublisher::new(Arc::clone(&env.bus), config.retry.clone());
        let release = ReleaseService::new(env.clone(), publisher.clone());
        let availability = AvailabilityView::new(env.clone(), config.cache_ttl);
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: WorkerContext {
                env,
                config,
                processed: ProcessedSet::new(),
                status: StatusBoard::new(),
                health: HealthBoard::new(),
                publisher,
            },
            availability,
            release,
            listeners: Vec::new(),
            breakers: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Register a downstream reaction to expired reservations.
    ///
    /// Listeners registered after [`start`](Self::start) are ignored.
    #[must_use]
    pub fn with_expiry_listener(mut self, listener: Arc<dyn ExpiryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Start the expiry sweeper, the hold watcher and the expiry reactor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if called twice.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning("engine".to_string()));
        }
        let config = &self.ctx.config;
        let mut background = self.background.lock().await;

        if config.enable_sweep {
            let sweeper = self.sweeper();
            let interval = config.sweep_interval;
            let shutdown = self.shutdown.subscribe();
            background.push(tokio::spawn(sweeper.run(interval, shutdown)));
        }

        if config.enable_fast_path {
            let watcher = HoldWatcher::new(self.ctx.env.clone(), self.release.clone());
            match watcher.subscribe().await {
                Ok(fired) => {
                    let shutdown = self.shutdown.subscribe();
                    background.push(tokio::spawn(watcher.run(fired, shutdown)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Hold timers unavailable, relying on sweep");
                }
            }
        }

        let reactor = self.listeners.iter().fold(
            ExpiryReactor::new(self.release.clone(), self.ctx.publisher.clone()),
            |reactor, listener| reactor.with_listener(Arc::clone(listener)),
        );
        match reactor.subscribe().await {
            Ok(events) => {
                let shutdown = self.shutdown.subscribe();
                background.push(tokio::spawn(reactor.run(events, shutdown)));
            }
            Err(e) => tracing::warn!(error = %e, "Expiry reactor not subscribed"),
        }

        tracing::info!(
            sweep = config.enable_sweep,
            fast_path = config.enable_fast_path,
            "Engine started"
        );
        Ok(())
    }

    /// Seed inventory for a new SKU and start its worker.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Ledger`] if the SKU already exists or the ledger
    /// fails.
    pub async fn create_sale(
        &self,
        sku_id: &SkuId,
        total: u32,
    ) -> Result<InventoryRecord, EngineError> {
        self.ensure_running()?;
        let record = self.ctx.env.ledger.create_inventory(sku_id, total).await?;
        self.spawn_worker(sku_id, false).await?;
        tracing::info!(sku = %sku_id, total, "Sale created");
        Ok(record)
    }

    /// Start the worker for a SKU whose inventory already exists (restart).
    ///
    /// The worker resumes from the queue's last acknowledged offset.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Ledger`] with [`LedgerError::UnknownSku`] if the
    /// SKU was never created, or [`EngineError::AlreadyRunning`].
    pub async fn resume_sale(&self, sku_id: &SkuId) -> Result<InventoryRecord, EngineError> {
        self.ensure_running()?;
        let record = self.ctx.env.ledger.inventory(sku_id).await?;
        self.spawn_worker(sku_id, true).await?;
        tracing::info!(sku = %sku_id, reserved = record.reserved, sold = record.sold, "Sale resumed");
        Ok(record)
    }

    /// Queue one allocation attempt.
    ///
    /// Returns the request id to poll with [`get_status`](Self::get_status) or
    /// wait on with [`await_outcome`](Self::await_outcome).
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidQuantity`] unless `quantity == 1`
    /// - [`EngineError::UnknownSku`] if no worker runs for the SKU
    /// - [`EngineError::Halted`] / [`EngineError::Degraded`] if the SKU cannot
    ///   take requests right now
    /// - [`EngineError::QueueFull`] when the SKU's queue is at its ceiling
    pub async fn submit(
        &self,
        user_id: UserId,
        sku_id: &SkuId,
        quantity: u32,
        idempotency_key: IdempotencyKey,
    ) -> Result<RequestId, EngineError> {
        if quantity != 1 {
            AllocatorMetrics::record_rejection("invalid_quantity");
            return Err(EngineError::InvalidQuantity(quantity));
        }
        self.ensure_running()?;

        let breaker = self
            .breakers
            .read()
            .await
            .get(sku_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSku(sku_id.clone()))?;
        if let Some(WorkerState::Halted(_)) = self.ctx.health.get(sku_id) {
            AllocatorMetrics::record_rejection("halted");
            return Err(EngineError::Halted(sku_id.clone()));
        }
        if breaker.state().await == State::Open {
            AllocatorMetrics::record_rejection("degraded");
            return Err(EngineError::Degraded(sku_id.clone()));
        }

        let request_id = RequestId::new();
        let now = self.ctx.env.clock.now();
        self.ctx.status.mark_pending(sku_id, request_id, now);

        let request = AllocationRequest {
            request_id,
            user_id,
            sku_id: sku_id.clone(),
            idempotency_key,
            enqueued_at: now,
        };
        match self.ctx.env.queue.enqueue(request).await {
            Ok(offset) => {
                tracing::trace!(sku = %sku_id, request_id = %request_id, offset, "Request queued");
                // Halted between the check above and the enqueue
                if let Some(WorkerState::Halted(_)) = self.ctx.health.get(sku_id) {
                    self.ctx.status.halt_pending(sku_id, now);
                }
                Ok(request_id)
            }
            Err(QueueError::QueueFull { sku_id, depth }) => {
                self.ctx.status.forget(request_id);
                AllocatorMetrics::record_rejection("queue_full");
                Err(EngineError::QueueFull { sku_id, depth })
            }
            Err(e) => {
                self.ctx.status.forget(request_id);
                Err(EngineError::Queue(e))
            }
        }
    }

    /// Status of a submitted request
    #[must_use]
    pub fn get_status(&self, request_id: RequestId) -> RequestStatus {
        self.ctx.status.get(request_id)
    }

    /// Wait for a request's outcome.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Halted`] if the SKU's allocator halted before deciding
    /// - [`EngineError::Timeout`] if the request is still pending after
    ///   `timeout` or is unknown
    pub async fn await_outcome(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<AllocationOutcome, EngineError> {
        match self.ctx.status.wait(request_id, timeout).await {
            RequestStatus::Decided(outcome) => Ok(outcome),
            RequestStatus::Halted(sku_id) => Err(EngineError::Halted(sku_id)),
            RequestStatus::Pending | RequestStatus::Unknown => {
                Err(EngineError::Timeout(request_id))
            }
        }
    }

    /// Recorded outcome for an idempotency key, straight from the ledger.
    ///
    /// # Errors
    ///
    /// Returns the ledger error.
    pub async fn outcome_for_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<ProcessedKey>, EngineError> {
        Ok(self.ctx.env.ledger.processed_outcome(key).await?)
    }

    /// Units left for a SKU, possibly up to one cache TTL stale.
    ///
    /// # Errors
    ///
    /// Returns the ledger error on a cache miss, including
    /// [`LedgerError::UnknownSku`].
    pub async fn get_availability(&self, sku_id: &SkuId) -> Result<Availability, EngineError> {
        Ok(self.availability.get(sku_id).await?)
    }

    /// Turn a held reservation into a sale.
    ///
    /// Confirming twice succeeds and publishes only once.
    ///
    /// # Errors
    ///
    /// - [`ConfirmError::NotFound`] for an unknown reservation
    /// - [`ConfirmError::Expired`] once the hold lapsed
    /// - [`ConfirmError::Ledger`] on store failure
    pub async fn confirm(
        &self,
        reservation_id: ReservationId,
    ) -> Result<ReservationRecord, ConfirmError> {
        let env = &self.ctx.env;
        let now = env.clock.now();
        let outcome = env
            .ledger
            .apply_confirm(reservation_id, now)
            .await
            .map_err(|e| match e {
                LedgerError::ReservationNotFound(id) => ConfirmError::NotFound(id),
                LedgerError::ReservationExpired(id) => ConfirmError::Expired(id),
                other => ConfirmError::Ledger(other),
            })?;

        if outcome.newly_confirmed {
            let reservation = &outcome.reservation;
            if let Err(e) = env.cache.invalidate(&reservation.sku_id).await {
                tracing::warn!(sku = %reservation.sku_id, error = %e, "Cache invalidation failed");
            }
            if let Err(e) = env.timers.disarm(&reservation.sku_id, reservation_id).await {
                tracing::debug!(reservation_id = %reservation_id, error = %e, "Failed to disarm hold timer");
            }
            // Publisher already logged and counted the failure
            let _ = self
                .ctx
                .publisher
                .publish(&ReservationEvent::confirmed(reservation, now))
                .await;
            ExpiryMetrics::record_confirmed();
            tracing::info!(
                sku = %reservation.sku_id,
                reservation_id = %reservation_id,
                "Reservation confirmed"
            );
        }
        Ok(outcome.reservation)
    }

    /// Point read of a reservation.
    ///
    /// # Errors
    ///
    /// Returns the ledger error.
    pub async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<ReservationRecord>, EngineError> {
        Ok(self.ctx.env.ledger.reservation(reservation_id).await?)
    }

    /// Run one expiry sweep now, independent of the periodic task.
    ///
    /// # Errors
    ///
    /// Returns the ledger error if the expired-row query fails.
    pub async fn sweep_once(&self) -> Result<SweepReport, EngineError> {
        Ok(self.sweeper().sweep_once().await?)
    }

    /// Per-SKU worker health
    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.ctx.health.report()
    }

    /// State of one SKU's worker
    #[must_use]
    pub fn worker_state(&self, sku_id: &SkuId) -> Option<WorkerState> {
        self.ctx.health.get(sku_id)
    }

    /// Stop accepting requests, let every worker finish its current batch and
    /// stop the background tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Engine shutting down");

        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        for (sku_id, handle) in workers {
            if let Err(e) = handle.await {
                tracing::warn!(sku = %sku_id, error = %e, "Worker supervisor ended abnormally");
            }
        }
        let background: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Engine stopped");
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if *self.shutdown.borrow() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(
            self.ctx.env.clone(),
            self.release.clone(),
            self.ctx.processed.clone(),
            self.ctx.status.clone(),
            self.ctx.config.sweep_batch_limit,
            self.ctx.config.processed_retention,
        )
    }

    /// Start a supervised worker; `rewind` redelivers anything a previous
    /// worker took but never acknowledged.
    async fn spawn_worker(&self, sku_id: &SkuId, rewind: bool) -> Result<(), EngineError> {
        let mut workers = self.workers.lock().await;
        if workers.get(sku_id).is_some_and(|handle| !handle.is_finished()) {
            return Err(EngineError::AlreadyRunning(sku_id.to_string()));
        }
        if rewind {
            self.ctx.env.queue.rewind(sku_id).await?;
        }

        let breaker = self
            .breakers
            .write()
            .await
            .entry(sku_id.clone())
            .or_insert_with(|| {
                CircuitBreaker::new(
                    format!("ledger:{sku_id}"),
                    self.ctx.config.circuit_breaker.clone(),
                )
            })
            .clone();

        let handle = tokio::spawn(supervise(
            sku_id.clone(),
            self.ctx.clone(),
            breaker,
            self.shutdown.subscribe(),
        ));
        workers.insert(sku_id.clone(), handle);
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.ctx.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Run a SKU's worker, restarting it after a crash.
///
/// Each restart rewinds the queue so the new worker resumes from the last
/// acknowledged offset. A worker halted on an invariant violation is never
/// restarted.
async fn supervise(
    sku_id: SkuId,
    ctx: WorkerContext,
    breaker: CircuitBreaker,
    shutdown: watch::Receiver<bool>,
) {
    let max_restarts = ctx.config.max_worker_restarts;
    let mut restarts = 0u32;

    loop {
        let worker = SkuWorker::new(sku_id.clone(), ctx.clone(), breaker.clone(), shutdown.clone());
        let exit = tokio::spawn(worker.run())
            .await
            .with_context(|| format!("worker for SKU {sku_id} crashed"));

        let err = match exit {
            Ok(WorkerExit::Shutdown | WorkerExit::Halted) => return,
            Err(err) => err,
        };
        if *shutdown.borrow() {
            return;
        }

        restarts += 1;
        AllocatorMetrics::record_restart(sku_id.as_str());
        if restarts > max_restarts {
            tracing::error!(
                page = true,
                sku = %sku_id,
                restarts = max_restarts,
                error = ?err,
                "Worker restart budget exhausted, halting SKU"
            );
            ctx.health.set(
                &sku_id,
                WorkerState::Halted(format!("restart budget exhausted: {err:#}")),
            );
            ctx.status.halt_pending(&sku_id, ctx.env.clock.now());
            return;
        }

        tracing::warn!(
            sku = %sku_id,
            restart = restarts,
            error = ?err,
            "Restarting SKU worker"
        );
        if let Err(e) = rewind(&ctx, &sku_id).await {
            tracing::error!(sku = %sku_id, error = %e, "Failed to rewind queue before restart");
        }
    }
}

async fn rewind(ctx: &WorkerContext, sku_id: &SkuId) -> anyhow::Result<()> {
    ctx.env
        .queue
        .rewind(sku_id)
        .await
        .context("queue rewind failed")?;
    Ok(())
}
