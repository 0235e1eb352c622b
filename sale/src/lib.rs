//! Flash-sale allocation service.
//!
//! Wires the engine from `flashsale-runtime` to its production backends:
//!
//! | Concern | Backend |
//! |---|---|
//! | Ledger, ingest queue | `PostgreSQL` (`flashsale-postgres`) |
//! | Availability cache, hold timers | Redis (`flashsale-redis`) |
//! | Reservation events | Redpanda (`flashsale-redpanda`) |
//!
//! Two binaries ship with the crate:
//! - `flash-sale`: the service, configured from the environment
//! - `demo`: an in-memory burst against a single SKU, no infrastructure needed
//!
//! # Example
//!
//! ```no_run
//! use flash_sale::{Config, FlashSaleApp};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! let app = FlashSaleApp::connect(&config).await?;
//! app.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;

pub use app::{AppError, ExpiryLog, FlashSaleApp, connect_backends};
pub use config::{Config, DatabaseConfig, EngineSettings, RedpandaConfig, SaleSpec};

/// Default tracing filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "flash_sale=info,flashsale_runtime=info";

/// Install the `fmt` subscriber with `RUST_LOG` or [`DEFAULT_LOG_FILTER`].
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
