//! Flash-sale service
//!
//! Connects Postgres, Redis and Redpanda, opens the sales listed in
//! `FLASHSALE_SALES` and runs until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! FLASHSALE_SALES="console=100,headphones=250" cargo run --bin flash-sale
//! ```

use flash_sale::{Config, FlashSaleApp};
use flashsale_runtime::metrics::MetricsServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    flash_sale::init_tracing();

    let config = Config::from_env();
    tracing::info!(
        redis = %config.redis_url,
        redpanda = %config.redpanda.brokers,
        sales = config.sales.len(),
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start()?;

    let app = FlashSaleApp::connect(&config).await?;
    app.start().await?;
    tracing::info!("Flash-sale service running; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    app.shutdown().await;
    Ok(())
}
