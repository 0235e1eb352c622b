//! Property tests: random interleavings of concurrent submits, confirms,
//! sweeps and lapsed holds never break the stock invariant or the
//! one-hold-per-user rule, and never stop the SKU from serving.

#![allow(clippy::unwrap_used)]

use flash_sale::{FlashSaleApp, SaleSpec};
use flashsale_core::ledger::InventoryLedger;
use flashsale_core::types::{
    AllocationOutcome, IdempotencyKey, ReservationId, ReservationStatus, SkuId, UserId,
};
use flashsale_runtime::{Engine, EngineConfig, WorkerState};
use flashsale_testing::InMemoryBackends;
use flashsale_testing::properties::{SaleStep, sale_steps, stock};
use futures::future::join_all;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

const USERS: usize = 8;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

async fn assert_ledger_consistent(backends: &InMemoryBackends, sku: &SkuId) {
    let record = backends.ledger.inventory(sku).await.unwrap();
    assert!(
        record.reserved + record.sold <= record.total,
        "oversold: {record:?}"
    );

    let reservations = backends.ledger.reservations_for(sku);
    let held = reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Reserved)
        .count();
    let sold = reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Confirmed)
        .count();
    assert_eq!(usize::try_from(record.reserved).unwrap(), held);
    assert_eq!(usize::try_from(record.sold).unwrap(), sold);

    let mut active_users = HashSet::new();
    for reservation in reservations.iter().filter(|r| {
        matches!(
            r.status,
            ReservationStatus::Reserved | ReservationStatus::Confirmed
        )
    }) {
        assert!(
            active_users.insert(reservation.user_id),
            "two active reservations for {}",
            reservation.user_id
        );
    }

    let mut keys = HashSet::new();
    for reservation in &reservations {
        assert!(
            keys.insert(reservation.idempotency_key.clone()),
            "key {} allocated twice",
            reservation.idempotency_key
        );
    }
}

const RETENTION: Duration = Duration::from_secs(10);

async fn run_sale(total: u32, steps: Vec<SaleStep>) {
    let backends = InMemoryBackends::with_tokio_clock();
    // Retention shorter than the hold, so purged keys get resubmitted
    let config = EngineConfig::default()
        .with_batch_size(3)
        .with_batch_max_wait(Duration::from_millis(2))
        .with_hold_duration(Duration::from_secs(20))
        .with_processed_retention(RETENTION)
        .with_sweep(false);
    let sku = SkuId::new("console");
    let app = FlashSaleApp::new(
        Engine::new(backends.environment(), config),
        vec![SaleSpec {
            sku_id: sku.clone(),
            total,
        }],
    );
    app.start().await.unwrap();
    let engine = app.engine();

    let users: Vec<UserId> = (0..USERS).map(|_| UserId::new()).collect();
    let mut granted: Vec<ReservationId> = Vec::new();
    let mut decided: HashMap<usize, (AllocationOutcome, Instant)> = HashMap::new();

    for step in steps {
        match step {
            SaleStep::Burst { requests, confirm: nth } => {
                let submissions = join_all(requests.iter().map(|&(user, key)| {
                    let sku = &sku;
                    let users = &users;
                    async move {
                        let request = engine
                            .submit(users[user], sku, 1, IdempotencyKey::new(format!("k{key}")))
                            .await
                            .unwrap();
                        let outcome = engine
                            .await_outcome(request, Duration::from_secs(10))
                            .await
                            .unwrap();
                        (key, outcome)
                    }
                }));
                let confirm = async {
                    if !granted.is_empty() {
                        // Expired and repeated confirms are legitimate failures here
                        let _ = engine.confirm(granted[nth % granted.len()]).await;
                    }
                };
                let (outcomes, (), swept) = tokio::join!(submissions, confirm, engine.sweep_once());
                swept.unwrap();

                for (key, outcome) in outcomes {
                    // A reservation stands for its key forever, other outcomes
                    // for as long as the key is retained
                    let binding = decided
                        .get(&key)
                        .filter(|(first, at)| {
                            first.is_reserved() || at.elapsed() + Duration::from_secs(1) < RETENTION
                        })
                        .map(|(first, _)| first.clone());
                    match binding {
                        Some(first) => assert_eq!(first, outcome, "key k{key} changed outcome"),
                        None => {
                            decided.insert(key, (outcome.clone(), Instant::now()));
                        }
                    }
                    if let Some(id) = outcome.reservation_id() {
                        if !granted.contains(&id) {
                            granted.push(id);
                        }
                    }
                }
            }
            SaleStep::Confirm { nth } => {
                if !granted.is_empty() {
                    let _ = engine.confirm(granted[nth % granted.len()]).await;
                }
            }
            SaleStep::Advance { seconds } => {
                tokio::time::advance(Duration::from_secs(seconds)).await;
                engine.sweep_once().await.unwrap();
            }
        }
        assert_ledger_consistent(&backends, &sku).await;
        assert!(
            !matches!(
                engine.worker_state(&sku),
                Some(WorkerState::Degraded(_) | WorkerState::Halted(_))
            ),
            "worker stopped serving: {:?}",
            engine.worker_state(&sku)
        );
    }

    app.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn stock_invariant_holds_under_random_sales(
        total in stock(6),
        steps in sale_steps(USERS, 40),
    ) {
        paused_runtime().block_on(run_sale(total, steps));
    }
}
