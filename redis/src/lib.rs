//! Redis backends for the flash-sale allocation engine.
//!
//! # Architecture
//!
//! Two non-authoritative helpers live in Redis:
//! - **Availability cache**: `flashsale:availability:{sku}` → bincode
//!   `Availability`, written with a millisecond TTL
//! - **Hold timers**: `flashsale:hold:{sku}:{reservation_id}`, a marker key whose
//!   TTL is the hold duration. Redis emits a keyevent `expired` notification
//!   when it lapses, which the engine treats as an early release signal.
//!
//! Losing either is harmless: reads fall back to the ledger and the periodic
//! sweep releases every lapsed hold.
//!
//! # Example
//!
//! ```no_run
//! use flashsale_redis::{RedisAvailabilityCache, RedisHoldTimers};
//! use flashsale_core::environment::SystemClock;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = RedisAvailabilityCache::new("redis://127.0.0.1:6379").await?;
//! let timers = RedisHoldTimers::new("redis://127.0.0.1:6379", Arc::new(SystemClock)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use flashsale_core::cache::CacheError;
use redis::Client;
use redis::aio::ConnectionManager;

/// Availability cache
pub mod cache;

/// Hold timers over keyspace notifications
pub mod timers;

pub use cache::RedisAvailabilityCache;
pub use timers::RedisHoldTimers;

/// Prefix shared by every key this crate writes
pub const KEY_PREFIX: &str = "flashsale";

/// Open a client and a connection manager for `redis_url`.
pub(crate) async fn connect(redis_url: &str) -> Result<(Client, ConnectionManager), CacheError> {
    let client = Client::open(redis_url)
        .map_err(|e| CacheError::Connection(format!("Failed to create Redis client: {e}")))?;
    let manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
        CacheError::Connection(format!("Failed to create Redis connection manager: {e}"))
    })?;
    Ok((client, manager))
}

pub(crate) fn command_error(error: &redis::RedisError) -> CacheError {
    if error.is_connection_dropped() || error.is_connection_refusal() || error.is_timeout() {
        CacheError::Connection(error.to_string())
    } else {
        CacheError::Command(error.to_string())
    }
}

/// Milliseconds for a Redis `PX` TTL; zero is rounded up because Redis
/// rejects it.
pub(crate) fn ttl_millis(ttl: std::time::Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
