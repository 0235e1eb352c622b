//! Per-SKU batch allocator.
//!
//! One [`SkuWorker`] owns one SKU. It is the only task that mutates that SKU's
//! `reserved` counter, so decisions never race with each other. Each cycle:
//!
//! 1. drain a batch from the ingest queue
//! 2. read one ledger snapshot and plan the batch ([`BatchPlanner`])
//! 3. commit every decision in one ledger transaction
//! 4. invalidate the cache, arm hold timers, record statuses, publish events
//! 5. acknowledge the batch's last offset
//!
//! Commit failures are retried with backoff behind a per-SKU circuit breaker.
//! Nothing is acknowledged until the commit and its events succeeded; a failed
//! cycle rewinds the queue and the batch is replayed against the
//! processed-key table.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::EngineConfig;
use crate::environment::EngineEnvironment;
use crate::health::{HealthBoard, WorkerState};
use crate::metrics::AllocatorMetrics;
use crate::plan::{BatchPlan, BatchPlanner, DecisionOrigin};
use crate::processed::ProcessedSet;
use crate::publisher::EventPublisher;
use crate::retry::retry_with_predicate;
use crate::status::StatusBoard;
use flashsale_core::event::ReservationEvent;
use flashsale_core::ledger::LedgerError;
use flashsale_core::types::{IdempotencyKey, QueuedRequest, SkuId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

const QUEUE_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// State shared by every worker of an engine.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    /// Backends
    pub env: EngineEnvironment,
    /// Engine configuration
    pub config: Arc<EngineConfig>,
    /// Recently decided keys
    pub processed: ProcessedSet,
    /// Request statuses for polling
    pub status: StatusBoard,
    /// Worker states
    pub health: HealthBoard,
    /// Reservation event publisher
    pub publisher: EventPublisher,
}

/// Why a worker's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested
    Shutdown,
    /// The ledger reported an invariant violation; the SKU must not continue
    Halted,
}

#[derive(Debug)]
enum BatchError {
    /// Ledger or bus unusable for now; retry after the breaker timeout
    Unavailable(String),
    /// Fatal for this SKU
    Halted(LedgerError),
}

/// Sequential allocator for one SKU.
pub struct SkuWorker {
    sku_id: SkuId,
    ctx: WorkerContext,
    planner: BatchPlanner,
    breaker: CircuitBreaker,
    shutdown: watch::Receiver<bool>,
}

impl SkuWorker {
    /// Worker for `sku_id` that stops once `shutdown` turns `true`.
    ///
    /// The breaker is passed in so it survives worker restarts and stays
    /// visible to `submit`.
    #[must_use]
    pub fn new(
        sku_id: SkuId,
        ctx: WorkerContext,
        breaker: CircuitBreaker,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let planner = BatchPlanner::new(ctx.config.hold_duration);
        Self {
            sku_id,
            ctx,
            planner,
            breaker,
            shutdown,
        }
    }

    /// Run batches until shutdown or an invariant violation.
    pub async fn run(mut self) -> WorkerExit {
        tracing::info!(sku = %self.sku_id, "SKU worker started");
        self.ctx.health.set(&self.sku_id, WorkerState::Running);

        let batch_size = self.ctx.config.batch_size;
        let max_wait = self.ctx.config.batch_max_wait;

        while !*self.shutdown.borrow() {
            let dequeued = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.ctx.env.queue.dequeue_batch(&self.sku_id, batch_size, max_wait) => batch,
            };

            let batch = match dequeued {
                Ok(batch) if batch.is_empty() => continue,
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(sku = %self.sku_id, error = %e, "Failed to dequeue batch");
                    if self.pause(QUEUE_ERROR_PAUSE).await {
                        break;
                    }
                    continue;
                }
            };

            match self.process(&batch).await {
                Ok(()) => {}
                Err(BatchError::Unavailable(reason)) => {
                    tracing::warn!(
                        sku = %self.sku_id,
                        batch_size = batch.len(),
                        reason = %reason,
                        "Batch not committed, will replay"
                    );
                    self.rewind().await;
                    self.ctx
                        .health
                        .set(&self.sku_id, WorkerState::Degraded(reason));
                    if self.pause(self.breaker.timeout()).await {
                        break;
                    }
                }
                Err(BatchError::Halted(err)) => {
                    tracing::error!(
                        page = true,
                        sku = %self.sku_id,
                        error = %err,
                        "Allocation invariant violated, halting SKU"
                    );
                    self.ctx
                        .health
                        .set(&self.sku_id, WorkerState::Halted(err.to_string()));
                    let closed = self
                        .ctx
                        .status
                        .halt_pending(&self.sku_id, self.ctx.env.clock.now());
                    tracing::warn!(sku = %self.sku_id, closed, "Pending requests closed as halted");
                    self.rewind().await;
                    return WorkerExit::Halted;
                }
            }
        }

        tracing::info!(sku = %self.sku_id, "SKU worker stopped");
        self.ctx.health.set(&self.sku_id, WorkerState::Stopped);
        WorkerExit::Shutdown
    }

    #[tracing::instrument(skip(self, batch), fields(sku = %self.sku_id, size = batch.len()), name = "allocate_batch")]
    async fn process(&self, batch: &[QueuedRequest]) -> Result<(), BatchError> {
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| {
                retry_with_predicate(
                    &self.ctx.config.retry,
                    "ledger_commit",
                    || self.attempt(batch),
                    LedgerError::is_transient,
                )
            })
            .await;

        let plan = match result {
            Ok(plan) => plan,
            Err(CircuitBreakerError::Open) => {
                return Err(BatchError::Unavailable("circuit breaker open".to_string()));
            }
            Err(CircuitBreakerError::Inner(err)) if err.is_invariant_violation() => {
                return Err(BatchError::Halted(err));
            }
            Err(CircuitBreakerError::Inner(err)) => {
                return Err(BatchError::Unavailable(err.to_string()));
            }
        };

        self.finish(batch.len(), plan, started.elapsed()).await
    }

    /// Snapshot, plan and commit one batch.
    async fn attempt(&self, batch: &[QueuedRequest]) -> Result<BatchPlan, LedgerError> {
        let mut prior = HashMap::new();
        let mut keys: Vec<IdempotencyKey> = Vec::new();
        let mut seen_keys = HashSet::new();
        let mut users: Vec<UserId> = Vec::new();
        let mut seen_users = HashSet::new();

        for entry in batch {
            let request = &entry.request;
            if seen_users.insert(request.user_id) {
                users.push(request.user_id);
            }
            if !seen_keys.insert(request.idempotency_key.clone()) {
                continue;
            }
            match self.ctx.processed.get(&request.idempotency_key) {
                Some(record) => {
                    prior.insert(request.idempotency_key.clone(), record);
                }
                None => keys.push(request.idempotency_key.clone()),
            }
        }

        let mut snapshot = self
            .ctx
            .env
            .ledger
            .batch_snapshot(&self.sku_id, &keys, &users)
            .await?;
        snapshot.prior.extend(prior);

        let now = self.ctx.env.clock.now();
        let plan = self.planner.plan(&self.sku_id, batch, &snapshot, now);
        if !plan.commit.is_empty() {
            self.ctx.env.ledger.apply_allocation(&plan.commit).await?;
        }
        Ok(plan)
    }

    /// Everything after a successful commit, ending with the ack.
    async fn finish(
        &self,
        size: usize,
        plan: BatchPlan,
        commit_duration: Duration,
    ) -> Result<(), BatchError> {
        let env = &self.ctx.env;
        let now = env.clock.now();

        self.ctx.processed.extend(plan.commit.processed.iter());

        if plan.held().next().is_some() {
            if let Err(e) = env.cache.invalidate(&self.sku_id).await {
                tracing::warn!(sku = %self.sku_id, error = %e, "Cache invalidation failed");
            }
        }

        if self.ctx.config.enable_fast_path {
            let held: Vec<_> = plan.held().collect();
            for (reservation_id, expires_at) in held {
                if let Err(e) = env.timers.arm(&self.sku_id, reservation_id, expires_at).await {
                    tracing::debug!(
                        sku = %self.sku_id,
                        reservation_id = %reservation_id,
                        error = %e,
                        "Hold timer not armed, sweep will release"
                    );
                }
            }
        }

        self.ctx.status.record(
            &self.sku_id,
            plan.decisions.iter().map(|d| (d.request_id, &d.outcome)),
            now,
        );
        for decision in &plan.decisions {
            if decision.origin == DecisionOrigin::Fresh {
                AllocatorMetrics::record_outcome(decision.outcome.as_str());
            }
        }

        let events: Vec<ReservationEvent> = plan
            .announced()
            .map(|d| ReservationEvent::decided(&d.processed))
            .collect();
        self.ctx
            .publisher
            .publish_all(events)
            .await
            .map_err(|e| BatchError::Unavailable(format!("event publish failed: {e}")))?;

        if let Some(offset) = plan.last_offset {
            env.queue
                .ack(&self.sku_id, offset)
                .await
                .map_err(|e| BatchError::Unavailable(format!("queue ack failed: {e}")))?;
        }

        AllocatorMetrics::record_batch(size, commit_duration);
        if let Ok(depth) = env.queue.depth(&self.sku_id).await {
            AllocatorMetrics::record_queue_depth(self.sku_id.as_str(), depth);
        }

        tracing::debug!(
            sku = %self.sku_id,
            batch_size = size,
            allocated = plan.allocated(),
            last_offset = ?plan.last_offset,
            "Batch committed"
        );
        self.ctx.health.set(&self.sku_id, WorkerState::Running);
        Ok(())
    }

    async fn rewind(&self) {
        if let Err(e) = self.ctx.env.queue.rewind(&self.sku_id).await {
            tracing::error!(sku = %self.sku_id, error = %e, "Failed to rewind queue");
        }
    }

    /// Sleep for `duration`; returns `true` if shutdown was requested meanwhile.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }
}

impl std::fmt::Debug for SkuWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkuWorker")
            .field("sku_id", &self.sku_id)
            .finish_non_exhaustive()
    }
}
