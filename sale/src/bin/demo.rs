//! Flash-sale demo
//!
//! Runs the real engine over the in-memory backends and replays a sale:
//! - 200 buyers race for 10 units
//! - every buyer retries once with the same idempotency key
//! - 4 winners check out, the rest let their hold lapse
//! - the sweep puts the lapsed units back on sale
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin demo
//! ```

use flash_sale::{FlashSaleApp, SaleSpec};
use flashsale_core::types::{AllocationOutcome, IdempotencyKey, SkuId, UserId};
use flashsale_runtime::{Engine, EngineConfig};
use flashsale_testing::InMemoryBackends;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const BUYERS: usize = 200;
const STOCK: u32 = 10;
const CHECKOUTS: usize = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    flash_sale::init_tracing();

    println!("\n============================================");
    println!("   Flash Sale - In-Memory Demo");
    println!("============================================\n");

    let backends = InMemoryBackends::default();
    let config = EngineConfig::default()
        .with_batch_size(50)
        .with_hold_duration(Duration::from_secs(2))
        .with_sweep_interval(Duration::from_millis(500));
    let sku = SkuId::new("limited-console");
    let app = Arc::new(FlashSaleApp::new(
        Engine::new(backends.environment(), config),
        vec![SaleSpec {
            sku_id: sku.clone(),
            total: STOCK,
        }],
    ));
    app.start().await?;
    println!("{STOCK} units of {sku} on sale, {BUYERS} buyers\n");

    // 1. Burst
    let mut tasks = Vec::with_capacity(BUYERS);
    for i in 0..BUYERS {
        let app = Arc::clone(&app);
        let sku = sku.clone();
        tasks.push(tokio::spawn(async move {
            let user = UserId::new();
            let key = IdempotencyKey::new(format!("order-{i}"));
            let engine = app.engine();
            let first = engine.submit(user, &sku, 1, key.clone()).await?;
            let retry = engine.submit(user, &sku, 1, key).await?;
            let first = engine.await_outcome(first, Duration::from_secs(5)).await?;
            let retry = engine.await_outcome(retry, Duration::from_secs(5)).await?;
            Ok::<_, flashsale_runtime::EngineError>((first, retry))
        }));
    }

    let mut tally: HashMap<&'static str, usize> = HashMap::new();
    let mut winners = Vec::new();
    let mut consistent_retries = 0;
    for task in tasks {
        let (first, retry) = task.await??;
        *tally.entry(first.as_str()).or_default() += 1;
        if first == retry {
            consistent_retries += 1;
        }
        if let AllocationOutcome::Reserved { reservation_id, .. } = first {
            winners.push(reservation_id);
        }
    }

    println!("1. Burst decided");
    for (outcome, count) in &tally {
        println!("   {outcome:<18} {count}");
    }
    println!("   retries matching first outcome: {consistent_retries}/{BUYERS}");
    let availability = app.engine().get_availability(&sku).await?;
    println!("   available now: {}/{}\n", availability.available, availability.total);

    // 2. Checkout
    for reservation_id in winners.iter().take(CHECKOUTS) {
        app.engine().confirm(*reservation_id).await?;
    }
    println!("2. {CHECKOUTS} buyers checked out\n");

    // 3. Expiry
    println!("3. Waiting for the remaining holds to lapse...");
    tokio::time::sleep(Duration::from_secs(3)).await;
    let availability = app.engine().get_availability(&sku).await?;
    println!(
        "   available now: {}/{} (sold {CHECKOUTS})\n",
        availability.available, availability.total
    );

    println!("Events published:");
    for event_type in [
        "reservation.created",
        "reservation.failed",
        "reservation.confirmed",
        "reservation.expired",
    ] {
        println!("   {event_type:<24} {}", backends.bus.count(event_type));
    }

    app.shutdown().await;
    println!("\nDemo complete");
    Ok(())
}
