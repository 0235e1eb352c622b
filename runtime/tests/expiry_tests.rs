//! Integration tests for expiry: each trigger on its own, their overlap,
//! confirmation races and retention housekeeping.

#![allow(clippy::unwrap_used)]

use flashsale_core::environment::Clock;
use flashsale_core::event::ReservationEvent;
use flashsale_core::ledger::InventoryLedger;
use flashsale_core::types::{IdempotencyKey, ReservationId, ReservationStatus, SkuId, UserId};
use flashsale_runtime::{
    ConfirmError, Engine, EngineConfig, EventPublisher, ExpiryListener, ReleaseService,
    ReleaseTrigger, RequestStatus, RetryPolicy,
};
use flashsale_testing::{InMemoryBackends, ManualClock, test_clock};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_max_wait(Duration::from_millis(5))
        .with_hold_duration(Duration::from_secs(2))
        .with_sweep_interval(Duration::from_secs(1))
}

async fn reserve(engine: &Engine, sku: &SkuId, key: &str) -> ReservationId {
    let id = engine
        .submit(UserId::new(), sku, 1, IdempotencyKey::new(key))
        .await
        .unwrap();
    engine
        .await_outcome(id, WAIT)
        .await
        .unwrap()
        .reservation_id()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn sweep_alone_releases_expired_holds() {
    let backends = InMemoryBackends::with_tokio_clock();
    let engine = Engine::new(backends.environment(), config().with_fast_path(false));
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();

    let reservation_id = reserve(&engine, &sku, "a").await;
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 0);

    // Hold of 2s plus one sweep interval
    tokio::time::sleep(Duration::from_secs(4)).await;

    let reservation = engine.reservation(reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 1);
    assert_eq!(backends.bus.count("reservation.expired"), 1);

    // The unit is sellable again
    reserve(&engine, &sku, "b").await;
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hold_timer_releases_without_sweep() {
    let backends = InMemoryBackends::with_tokio_clock();
    let engine = Engine::new(backends.environment(), config().with_sweep(false));
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();

    let reservation_id = reserve(&engine, &sku, "a").await;
    assert_eq!(backends.timers.armed(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let reservation = engine.reservation(reservation_id).await.unwrap().unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    assert_eq!(backends.timers.armed(), 0);
    assert_eq!(backends.ledger.inventory(&sku).await.unwrap().reserved, 0);
    engine.shutdown().await;
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<ReservationEvent>>,
}

impl ExpiryListener for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn on_expired(
        &self,
        event: &ReservationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        let event = event.clone();
        Box::pin(async move {
            self.seen.lock().unwrap().push(event);
            Ok(())
        })
    }
}

#[tokio::test(start_paused = true)]
async fn reactor_notifies_listeners_once_per_release() {
    let backends = InMemoryBackends::with_tokio_clock();
    let recorder = Arc::new(Recorder::default());
    let engine = Engine::new(backends.environment(), config())
        .with_expiry_listener(recorder.clone());
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 2).await.unwrap();

    let reservation_id = reserve(&engine, &sku, "a").await;
    // Fast path, sweep and reactor all see this hold
    tokio::time::sleep(Duration::from_secs(4)).await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].reservation_id(), Some(reservation_id));

    let inventory = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!(inventory.reserved, 0);
    assert_eq!(inventory.available(), 2);
    assert_eq!(backends.bus.count("reservation.expired"), 1);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overlapping_triggers_credit_once() {
    let backends = InMemoryBackends::with_tokio_clock();
    let env = backends.environment();
    let sku = SkuId::new("console");
    let engine = Engine::new(env.clone(), config().with_sweep(false).with_fast_path(false));
    engine.start().await.unwrap();
    engine.create_sale(&sku, 1).await.unwrap();
    let reservation_id = reserve(&engine, &sku, "a").await;

    tokio::time::sleep(Duration::from_secs(3)).await;

    let release = ReleaseService::new(
        env.clone(),
        EventPublisher::new(env.bus.clone(), RetryPolicy::default()),
    );
    let ids = [reservation_id];
    let (sweep, fast) = tokio::join!(
        release.release(&sku, &ids, ReleaseTrigger::Sweep),
        release.release(&sku, &ids, ReleaseTrigger::FastPath),
    );
    assert_eq!(sweep.unwrap().len() + fast.unwrap().len(), 1);

    let inventory = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!(inventory.reserved, 0);
    assert!(inventory.is_consistent());
    assert_eq!(backends.bus.count("reservation.expired"), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn confirm_moves_hold_to_sold_once() {
    let backends = InMemoryBackends::default();
    let engine = Engine::new(
        backends.environment(),
        EngineConfig::default().with_batch_max_wait(Duration::from_millis(5)),
    );
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 3).await.unwrap();

    let reservation_id = reserve(&engine, &sku, "a").await;
    let confirmed = engine.confirm(reservation_id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);

    // Idempotent
    let again = engine.confirm(reservation_id).await.unwrap();
    assert_eq!(again.status, ReservationStatus::Confirmed);
    assert_eq!(backends.bus.count("reservation.confirmed"), 1);

    let inventory = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!((inventory.reserved, inventory.sold), (0, 1));
    assert_eq!(engine.get_availability(&sku).await.unwrap().available, 2);
    assert_eq!(backends.timers.armed(), 0);

    let unknown = ReservationId::new();
    assert_eq!(
        engine.confirm(unknown).await,
        Err(ConfirmError::NotFound(unknown))
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn confirm_after_deadline_is_expired_even_before_sweep() {
    let backends = InMemoryBackends::with_tokio_clock();
    let engine = Engine::new(
        backends.environment(),
        config().with_sweep(false).with_fast_path(false),
    );
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();

    let reservation_id = reserve(&engine, &sku, "a").await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(
        engine.confirm(reservation_id).await,
        Err(ConfirmError::Expired(reservation_id))
    );
    let report = engine.sweep_once().await.unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(
        engine.confirm(reservation_id).await,
        Err(ConfirmError::Expired(reservation_id))
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn sweep_purges_decided_keys_after_retention() {
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let backends = InMemoryBackends::new(clock.clone(), u64::MAX);
    let engine = Engine::new(
        backends.environment(),
        EngineConfig::default()
            .with_batch_max_wait(Duration::from_millis(5))
            .with_sweep(false)
            .with_fast_path(false)
            .with_processed_retention(Duration::from_secs(300)),
    );
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();

    let request_id = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("k"))
        .await
        .unwrap();
    engine.await_outcome(request_id, WAIT).await.unwrap();
    assert!(
        engine
            .outcome_for_key(&IdempotencyKey::new("k"))
            .await
            .unwrap()
            .is_some()
    );

    // Past retention, still inside the 10 minute hold
    clock.advance(chrono::Duration::minutes(6));
    let report = engine.sweep_once().await.unwrap();

    assert_eq!(report.released, 0);
    assert_eq!(report.purged_keys, 1);
    assert_eq!(engine.get_status(request_id), RequestStatus::Unknown);
    assert!(
        engine
            .outcome_for_key(&IdempotencyKey::new("k"))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(backends.ledger.processed_len(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn reused_key_after_expiry_and_purge_keeps_the_sku_serving() {
    let clock = Arc::new(ManualClock::new(test_clock().now()));
    let backends = InMemoryBackends::new(clock.clone(), u64::MAX);
    let engine = Engine::new(
        backends.environment(),
        EngineConfig::default()
            .with_batch_max_wait(Duration::from_millis(5))
            .with_hold_duration(Duration::from_secs(120))
            .with_processed_retention(Duration::from_secs(60))
            .with_sweep(false)
            .with_fast_path(false),
    );
    engine.start().await.unwrap();
    let sku = SkuId::new("console");
    engine.create_sale(&sku, 1).await.unwrap();
    let user = UserId::new();
    let key = IdempotencyKey::new("k");

    let first = engine.submit(user, &sku, 1, key.clone()).await.unwrap();
    let first = engine.await_outcome(first, WAIT).await.unwrap();
    let reservation_id = first.reservation_id().unwrap();

    // Past both the hold and the retention window
    clock.advance(chrono::Duration::minutes(3));
    let report = engine.sweep_once().await.unwrap();
    assert_eq!((report.released, report.purged_keys), (1, 1));

    let retried = engine.submit(user, &sku, 1, key).await.unwrap();
    assert_eq!(engine.await_outcome(retried, WAIT).await.unwrap(), first);

    let other = engine
        .submit(UserId::new(), &sku, 1, IdempotencyKey::new("other"))
        .await
        .unwrap();
    let other = engine.await_outcome(other, WAIT).await.unwrap();
    assert!(other.is_reserved());
    assert_ne!(other.reservation_id(), Some(reservation_id));

    assert_eq!(
        engine.worker_state(&sku),
        Some(flashsale_runtime::WorkerState::Running)
    );
    let record = backends.ledger.inventory(&sku).await.unwrap();
    assert_eq!((record.reserved, record.sold), (1, 0));
    assert_eq!(backends.ledger.reservations_for(&sku).len(), 2);
    engine.shutdown().await;
}
