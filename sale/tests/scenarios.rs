//! End-to-end sale scenarios over the in-memory backends.
//!
//! Each test drives the service the way a client would: open a sale, submit,
//! wait for outcomes, confirm, let holds lapse.

#![allow(clippy::unwrap_used)]

use flash_sale::{FlashSaleApp, SaleSpec};
use flashsale_core::ledger::InventoryLedger;
use flashsale_core::types::{
    AllocationOutcome, IdempotencyKey, ReservationId, ReservationStatus, SkuId, UserId,
};
use flashsale_runtime::{Engine, EngineConfig, RequestStatus};
use flashsale_testing::InMemoryBackends;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_max_wait(Duration::from_millis(5))
        .with_hold_duration(Duration::from_secs(2))
        .with_sweep_interval(Duration::from_secs(1))
}

async fn open(backends: &InMemoryBackends, config: EngineConfig, total: u32) -> (FlashSaleApp, SkuId) {
    let sku = SkuId::new("console");
    let app = FlashSaleApp::new(
        Engine::new(backends.environment(), config),
        vec![SaleSpec {
            sku_id: sku.clone(),
            total,
        }],
    );
    app.start().await.unwrap();
    (app, sku)
}

/// Submit one request per user, in order, and wait for every outcome.
async fn burst(app: &FlashSaleApp, sku: &SkuId, count: usize) -> Vec<AllocationOutcome> {
    let engine = app.engine();
    let mut requests = Vec::with_capacity(count);
    for i in 0..count {
        let id = engine
            .submit(UserId::new(), sku, 1, IdempotencyKey::new(format!("order-{i}")))
            .await
            .unwrap();
        requests.push(id);
    }
    let mut outcomes = Vec::with_capacity(count);
    for id in requests {
        outcomes.push(engine.await_outcome(id, WAIT).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn ten_buyers_take_all_ten_units() {
    let backends = InMemoryBackends::default();
    let (app, sku) = open(&backends, config(), 10).await;

    let outcomes = burst(&app, &sku, 10).await;

    assert!(outcomes.iter().all(AllocationOutcome::is_reserved));
    let availability = app.engine().get_availability(&sku).await.unwrap();
    assert_eq!((availability.available, availability.total), (0, 10));
    assert_eq!(backends.bus.count("reservation.created"), 10);
    app.shutdown().await;
}

#[tokio::test]
async fn first_ten_of_fifteen_win_in_arrival_order() {
    let backends = InMemoryBackends::default();
    let (app, sku) = open(&backends, config().with_batch_size(4), 10).await;

    let outcomes = burst(&app, &sku, 15).await;

    assert!(outcomes[..10].iter().all(AllocationOutcome::is_reserved));
    assert!(outcomes[10..].iter().all(|o| *o == AllocationOutcome::OutOfStock));
    assert_eq!(backends.bus.count("reservation.failed"), 5);

    let record = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!((record.reserved, record.sold, record.available()), (10, 0, 0));
    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lapsed_hold_returns_stock_after_hold_plus_sweep_interval() {
    let backends = InMemoryBackends::with_tokio_clock();
    let (app, sku) = open(&backends, config().with_fast_path(false), 1).await;

    let outcome = burst(&app, &sku, 1).await.remove(0);
    let reservation_id = outcome.reservation_id().unwrap();
    assert_eq!(app.engine().get_availability(&sku).await.unwrap().available, 0);

    // Hold 2s, sweep every 1s
    tokio::time::sleep(Duration::from_secs(3) + Duration::from_millis(100)).await;

    assert_eq!(app.engine().get_availability(&sku).await.unwrap().available, 1);
    let reservation = app.engine().reservation(reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    assert_eq!(backends.bus.count("reservation.expired"), 1);
    app.shutdown().await;
}

#[tokio::test]
async fn duplicate_key_before_and_after_processing_returns_same_reservation() {
    let backends = InMemoryBackends::default();
    let (app, sku) = open(&backends, config(), 5).await;
    let engine = app.engine();
    let user = UserId::new();
    let key = IdempotencyKey::new("checkout-42");

    // Both queued before the worker decides either
    let first = engine.submit(user, &sku, 1, key.clone()).await.unwrap();
    let racing = engine.submit(user, &sku, 1, key.clone()).await.unwrap();
    let first = engine.await_outcome(first, WAIT).await.unwrap();
    let racing = engine.await_outcome(racing, WAIT).await.unwrap();

    let late = engine.submit(user, &sku, 1, key.clone()).await.unwrap();
    let late = engine.await_outcome(late, WAIT).await.unwrap();

    let reservation_id: Option<ReservationId> = first.reservation_id();
    assert!(reservation_id.is_some());
    assert_eq!(racing.reservation_id(), reservation_id);
    assert_eq!(late.reservation_id(), reservation_id);

    let record = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!(record.reserved, 1);
    assert_eq!(backends.bus.count("reservation.created"), 1);
    assert_eq!(
        engine.outcome_for_key(&key).await.unwrap().map(|p| p.outcome),
        Some(first)
    );
    app.shutdown().await;
}

#[tokio::test]
async fn checkout_then_repeat_purchase_is_already_reserved() {
    let backends = InMemoryBackends::default();
    let (app, sku) = open(&backends, config(), 3).await;
    let engine = app.engine();
    let user = UserId::new();

    let id = engine
        .submit(user, &sku, 1, IdempotencyKey::new("a"))
        .await
        .unwrap();
    let reservation_id = engine
        .await_outcome(id, WAIT)
        .await
        .unwrap()
        .reservation_id()
        .unwrap();
    let confirmed = engine.confirm(reservation_id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);

    let again = engine
        .submit(user, &sku, 1, IdempotencyKey::new("b"))
        .await
        .unwrap();
    assert_eq!(
        engine.await_outcome(again, WAIT).await.unwrap(),
        AllocationOutcome::AlreadyReserved
    );
    assert!(matches!(engine.get_status(again), RequestStatus::Decided(AllocationOutcome::AlreadyReserved)));

    let record = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!((record.reserved, record.sold), (0, 1));
    app.shutdown().await;
}

#[tokio::test]
async fn reopening_an_existing_sale_resumes_it() {
    let backends = InMemoryBackends::default();
    let sku = SkuId::new("console");
    backends.ledger.create_inventory(&sku, 4).await.unwrap();

    let (app, sku) = open(&backends, config(), 99).await;

    // Ledger keeps the stored total
    let availability = app.engine().get_availability(&sku).await.unwrap();
    assert_eq!(availability.total, 4);
    assert!(burst(&app, &sku, 1).await[0].is_reserved());
    app.shutdown().await;
}
