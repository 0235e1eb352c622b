//! Integration tests for the per-SKU worker: commit-then-ack, retries, the
//! circuit breaker, invariant halts and supervised restarts.
//!
//! All tests run the real engine over the in-memory backends.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use flashsale_core::ledger::{InventoryLedger, LedgerError};
use flashsale_core::queue::IngestQueue;
use flashsale_core::types::{
    AllocationOutcome, AllocationRequest, IdempotencyKey, RequestId, SkuId, UserId,
};
use flashsale_runtime::{
    CircuitBreakerConfig, Engine, EngineConfig, EngineError, HealthStatus, RequestStatus,
    RetryPolicy, WorkerState,
};
use flashsale_testing::InMemoryBackends;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_max_wait(Duration::from_millis(5))
        .with_sweep(false)
        .with_fast_path(false)
        .with_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(Duration::from_millis(5))
                .max_delay(Duration::from_millis(20))
                .build(),
        )
        .with_circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .timeout(Duration::from_millis(150))
                .success_threshold(1)
                .build(),
        )
}

async fn engine_with(backends: &InMemoryBackends, config: EngineConfig, stock: u32) -> (Engine, SkuId) {
    let engine = Engine::new(backends.environment(), config);
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, stock).await.unwrap();
    (engine, sku)
}

async fn wait_for_state(engine: &Engine, sku: &SkuId, wanted: fn(&WorkerState) -> bool) {
    tokio::time::timeout(WAIT, async {
        loop {
            if engine.worker_state(sku).as_ref().is_some_and(wanted) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn batch_is_acknowledged_after_commit_and_events() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 3).await;

    let mut requests = Vec::new();
    for i in 0..5 {
        let id = engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new(format!("k{i}")))
            .await
            .unwrap();
        requests.push(id);
    }

    let mut outcomes = Vec::new();
    for id in &requests {
        outcomes.push(engine.await_outcome(*id, WAIT).await.unwrap());
    }
    assert_eq!(outcomes.iter().filter(|o| o.is_reserved()).count(), 3);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == AllocationOutcome::OutOfStock)
            .count(),
        2
    );

    // Ack follows the events
    tokio::time::timeout(WAIT, async {
        while backends.queue.acked_offset(&sku) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(backends.queue.depth(&sku).await.unwrap(), 0);
    assert_eq!(backends.bus.count("reservation.created"), 3);
    assert_eq!(backends.bus.count("reservation.failed"), 2);

    let inventory = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!(inventory.reserved, 3);
    assert!(inventory.is_consistent());

    engine.shutdown().await;
    assert_eq!(engine.worker_state(&sku), Some(WorkerState::Stopped));
}

#[tokio::test]
async fn transient_commit_failures_are_retried() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 5).await;
    backends
        .ledger
        .fail_next_allocations(2, LedgerError::Transaction("serialization failure".into()));

    let id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    let outcome = engine.await_outcome(id, WAIT).await.unwrap();

    assert!(outcome.is_reserved());
    assert_eq!(backends.ledger.allocation_commits(), 1);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 1);
    assert_eq!(engine.worker_state(&sku), Some(WorkerState::Running));
    engine.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_open_the_breaker_then_recover() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 5).await;
    // Initial attempt plus both retries fail
    backends
        .ledger
        .fail_next_allocations(3, LedgerError::Database("connection reset".into()));

    let first = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("first"))
        .await
        .unwrap();

    wait_for_state(&engine, &sku, |s| matches!(s, WorkerState::Degraded(_))).await;
    assert_eq!(engine.health().status, HealthStatus::Degraded);
    let refused = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("second"))
        .await;
    assert!(matches!(refused, Err(EngineError::Degraded(_))));

    // After the breaker timeout the batch is replayed and committed once
    let outcome = engine.await_outcome(first, WAIT).await.unwrap();
    assert!(outcome.is_reserved());
    wait_for_state(&engine, &sku, |s| *s == WorkerState::Running).await;
    assert_eq!(backends.ledger.allocation_commits(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn invariant_violation_halts_only_that_sku() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 5).await;
    let other = SkuId::new("headphones");
    engine.create_sale(&other, 5).await.unwrap();

    backends.ledger.fail_next_allocations(
        1,
        LedgerError::InvariantViolation {
            sku_id: sku.clone(),
            detail: "reserved + sold > total".into(),
        },
    );

    let stuck = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("stuck"))
        .await
        .unwrap();
    wait_for_state(&engine, &sku, |s| matches!(s, WorkerState::Halted(_))).await;

    // Queued before the halt, closed rather than left pending
    assert!(matches!(
        engine.await_outcome(stuck, Duration::from_millis(50)).await,
        Err(EngineError::Halted(_))
    ));
    assert_eq!(engine.get_status(stuck), RequestStatus::Halted(sku.clone()));
    assert!(engine.health().is_unhealthy());
    assert!(matches!(
        engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new("later"))
            .await,
        Err(EngineError::Halted(_))
    ));
    // Nothing acknowledged, nothing allocated
    assert_eq!(backends.queue.acked_offset(&sku), 0);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 0);

    // The other SKU keeps selling
    let id = engine
        .submit(UserId::new(), &other, 1, IdempotencyKey::new("other"))
        .await
        .unwrap();
    assert!(engine.await_outcome(id, WAIT).await.unwrap().is_reserved());
    engine.shutdown().await;
}

#[tokio::test]
async fn crashed_worker_is_restarted_from_last_ack() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 5).await;
    backends.ledger.panic_next_allocations(1);

    let id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    let outcome = engine.await_outcome(id, WAIT).await.unwrap();

    assert!(outcome.is_reserved());
    assert_eq!(backends.ledger.allocation_commits(), 1);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 1);
    wait_for_state(&engine, &sku, |s| *s == WorkerState::Running).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn restart_budget_exhaustion_halts_the_sku() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config().with_max_worker_restarts(1), 5).await;
    backends.ledger.panic_next_allocations(2);

    let stuck = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    wait_for_state(&engine, &sku, |s| matches!(s, WorkerState::Halted(_))).await;

    assert_eq!(backends.ledger.allocation_commits(), 0);
    assert!(matches!(
        engine.await_outcome(stuck, Duration::from_millis(50)).await,
        Err(EngineError::Halted(_))
    ));
    assert!(matches!(
        engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k2"))
            .await,
        Err(EngineError::Halted(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn failed_publish_replays_without_reallocating() {
    let backends = InMemoryBackends::default();
    let (engine, sku) = engine_with(&backends, config(), 5).await;
    backends.bus.set_failing(true);

    let id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    // Committed, so the outcome is visible before the event goes out
    let outcome = engine.await_outcome(id, WAIT).await.unwrap();
    assert!(outcome.is_reserved());
    wait_for_state(&engine, &sku, |s| matches!(s, WorkerState::Degraded(_))).await;
    assert_eq!(backends.queue.acked_offset(&sku), 0);
    assert_eq!(backends.bus.count("reservation.created"), 0);

    backends.bus.set_failing(false);
    tokio::time::timeout(WAIT, async {
        while backends.queue.acked_offset(&sku) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Replay republished the same reservation; the ledger saw one commit
    let events = backends.bus.reservation_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reservation_id(), outcome.reservation_id());
    assert_eq!(backends.ledger.allocation_commits(), 1);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn resumed_sale_replays_unacknowledged_requests() {
    let backends = InMemoryBackends::default();
    let sku = SkuId::new("console");
    backends.ledger.create_inventory(&sku, 2).await.unwrap();

    // Queued by a previous process that never processed it
    backends
        .queue
        .enqueue(AllocationRequest {
            request_id: RequestId::new(),
            user_id: UserId::new(),
            sku_id: sku.clone(),
            idempotency_key: IdempotencyKey::new("before-restart"),
            enqueued_at: Utc::now(),
        })
        .await
        .unwrap();

    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    assert!(matches!(
        engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new("early"))
            .await,
        Err(EngineError::UnknownSku(_))
    ));
    engine.resume_sale(&sku).await.unwrap();
    assert!(matches!(
        engine.resume_sale(&sku).await,
        Err(EngineError::AlreadyRunning(_))
    ));

    let id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("after-restart"))
        .await
        .unwrap();
    assert!(engine.await_outcome(id, WAIT).await.unwrap().is_reserved());

    // FIFO across the restart: the old request was decided first
    let rows = backends.ledger.reservations_for(&sku);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].idempotency_key, IdempotencyKey::new("before-restart"));
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 0);
    engine.shutdown().await;
}
