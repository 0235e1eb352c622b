//! Integration tests for the engine surface: admission, availability reads
//! and lifecycle.

#![allow(clippy::unwrap_used)]

use flashsale_core::environment::SystemClock;
use flashsale_core::ledger::InventoryLedger;
use flashsale_core::types::{
    AllocationOutcome, Availability, IdempotencyKey, RequestId, SkuId, UserId,
};
use flashsale_runtime::{Engine, EngineConfig, EngineError, HealthStatus, RequestStatus};
use flashsale_testing::InMemoryBackends;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_max_wait(Duration::from_millis(5))
        .with_sweep(false)
        .with_fast_path(false)
}

#[tokio::test]
async fn stale_cache_never_oversells() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 2).await.unwrap();

    // The cache claims plenty of stock
    backends.cache.poison(
        &sku,
        Availability {
            available: 100,
            total: 100,
        },
    );
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 100);

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            engine
                .submit(UserId::new(), &sku, 1, IdempotencyKey::new(format!("k{i}")))
                .await
                .unwrap(),
        );
    }
    let mut reserved = 0;
    for id in ids {
        if engine.await_outcome(id, WAIT).await.unwrap().is_reserved() {
            reserved += 1;
        }
    }

    assert_eq!(reserved, 2);
    let inventory = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!(inventory.reserved, 2);
    assert!(inventory.is_consistent());
    // The committing batch dropped the poisoned entry
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn availability_is_read_through() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 4).await.unwrap();

    assert!(!backends.cache.contains(&sku));
    let first = engine.get_availability(&sku).await.unwrap();
    assert_eq!(first, Availability { available: 4, total: 4 });
    assert!(backends.cache.contains(&sku));

    let id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    engine.await_outcome(id, WAIT).await.unwrap();
    assert!(backends.cache.invalidations() >= 1);
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 3);

    assert!(matches!(
        engine.get_availability(&SkuId::new("missing")).await,
        Err(EngineError::Ledger(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn queue_ceiling_is_backpressure() {
    let backends = InMemoryBackends::new(Arc::new(SystemClock), 1);
    let engine = Engine::new(
        backends.environment(),
        // Long enough that the first request is still queued
        config().with_batch_max_wait(Duration::from_millis(200)),
    );
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 10).await.unwrap();

    let mut rejected = None;
    for i in 0..50 {
        match engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new(format!("k{i}")))
            .await
        {
            Ok(_) => {}
            Err(e) => {
                rejected = Some(e);
                break;
            }
        }
    }

    let err = rejected.unwrap();
    assert!(matches!(err, EngineError::QueueFull { depth: 1, .. }));
    assert!(err.is_retryable());
    engine.shutdown().await;
}

#[tokio::test]
async fn only_single_units_are_accepted() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 10).await.unwrap();

    for quantity in [0, 2, 5] {
        let result = engine
            .submit(UserId::new(), &sku, quantity, IdempotencyKey::new("k"))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidQuantity(q)) if q == quantity));
    }
    assert_eq!(backends.queue.acked_offset(&sku), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn resubmitting_a_key_returns_the_first_outcome() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 5).await.unwrap();
    let user = UserId::new();

    let first = engine
        .submit(user, &sku, 1, IdempotencyKey::new("retry-me"))
        .await
        .unwrap();
    let first = engine.await_outcome(first, WAIT).await.unwrap();

    let second = engine
        .submit(user, &sku, 1, IdempotencyKey::new("retry-me"))
        .await
        .unwrap();
    let second = engine.await_outcome(second, WAIT).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 1);
    assert_eq!(
        engine
            .outcome_for_key(&IdempotencyKey::new("retry-me"))
            .await
            .unwrap(),
        Some(first)
    );

    // A new key for the same user is refused, not double-sold
    let third = engine
        .submit(user, &sku, 1, IdempotencyKey::new("fresh"))
        .await
        .unwrap();
    assert_eq!(
        engine.await_outcome(third, WAIT).await.unwrap(),
        AllocationOutcome::AlreadyReserved
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn lifecycle_guards() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(backends.environment(), config());
    engine.start().await.unwrap();
    assert!(matches!(
        engine.start().await,
        Err(EngineError::AlreadyRunning(_))
    ));

    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();
    assert!(matches!(
        engine.create_sale(&sku, 1).await,
        Err(EngineError::Ledger(_))
    ));
    assert_eq!(engine.health().status, HealthStatus::Healthy);
    assert_eq!(
        engine.get_status(RequestId::new()),
        RequestStatus::Unknown
    );

    engine.shutdown().await;
    // Idempotent
    engine.shutdown().await;
    assert!(matches!(
        engine
            .submit(UserId::new(), &sku, 1, IdempotencyKey::new("late"))
            .await,
        Err(EngineError::ShuttingDown)
    ));
}
