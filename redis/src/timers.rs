//! Hold timers as self-expiring Redis keys.
//!
//! `arm` writes `flashsale:hold:{sku}:{reservation_id}` with a `PX` TTL equal to
//! the time left on the hold. `subscribe` listens to `__keyevent@*__:expired`
//! and turns every lapsed hold key back into a [`HoldExpiry`].
//!
//! Redis only publishes expiry events with `notify-keyspace-events` containing
//! `Ex`. `subscribe` tries to enable it and logs a warning when the server
//! refuses (managed instances often block `CONFIG`).

use crate::{KEY_PREFIX, command_error, connect, ttl_millis};
use flashsale_core::cache::{CacheError, HoldExpiry, HoldExpiryStream, HoldTimers};
use flashsale_core::environment::Clock;
use flashsale_core::types::{ReservationId, SkuId};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const EXPIRED_CHANNELS: &str = "__keyevent@*__:expired";

/// [`HoldTimers`] on Redis key expiry.
#[derive(Clone)]
pub struct RedisHoldTimers {
    client: Client,
    conn_manager: ConnectionManager,
    clock: Arc<dyn Clock>,
}

impl RedisHoldTimers {
    /// Connect to `redis_url`; `clock` converts hold deadlines into TTLs.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if Redis cannot be reached.
    pub async fn new(redis_url: &str, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let (client, conn_manager) = connect(redis_url).await?;
        Ok(Self {
            client,
            conn_manager,
            clock,
        })
    }

    /// Redis key marking a live hold
    #[must_use]
    pub fn key(sku_id: &SkuId, reservation_id: ReservationId) -> String {
        format!("{KEY_PREFIX}:hold:{sku_id}:{reservation_id}")
    }

    /// Parse a hold key back into its SKU and reservation.
    ///
    /// The reservation id is the last segment, so SKUs may contain `:`.
    #[must_use]
    pub fn parse_key(key: &str) -> Option<HoldExpiry> {
        let rest = key.strip_prefix(KEY_PREFIX)?.strip_prefix(":hold:")?;
        let (sku, id) = rest.rsplit_once(':')?;
        if sku.is_empty() {
            return None;
        }
        let reservation_id = Uuid::parse_str(id).ok().map(ReservationId::from_uuid)?;
        Some(HoldExpiry {
            sku_id: SkuId::new(sku),
            reservation_id,
        })
    }

    async fn enable_notifications(&self) {
        let mut conn = self.conn_manager.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                "Could not enable keyspace notifications; fast-path expiry relies on server config"
            );
        }
    }
}

impl std::fmt::Debug for RedisHoldTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHoldTimers").finish_non_exhaustive()
    }
}

impl HoldTimers for RedisHoldTimers {
    fn arm(
        &self,
        sku_id: &SkuId,
        reservation_id: ReservationId,
        expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let key = Self::key(sku_id, reservation_id);
        Box::pin(async move {
            let remaining = (expires_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let mut conn = self.conn_manager.clone();
            let () = conn
                .pset_ex(&key, 1u8, ttl_millis(remaining))
                .await
                .map_err(|e| command_error(&e))?;
            Ok(())
        })
    }

    fn disarm(
        &self,
        sku_id: &SkuId,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let key = Self::key(sku_id, reservation_id);
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: u64 = conn.del(&key).await.map_err(|e| command_error(&e))?;
            Ok(())
        })
    }

    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HoldExpiryStream, CacheError>> + Send + '_>> {
        Box::pin(async move {
            self.enable_notifications().await;

            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| CacheError::Connection(format!("Failed to open pubsub: {e}")))?;
            pubsub
                .psubscribe(EXPIRED_CHANNELS)
                .await
                .map_err(|e| command_error(&e))?;
            tracing::info!(channels = EXPIRED_CHANNELS, "Listening for hold expiry");

            let stream = pubsub.into_on_message().filter_map(|msg| {
                let expiry = msg
                    .get_payload::<String>()
                    .ok()
                    .and_then(|key| Self::parse_key(&key));
                futures::future::ready(expiry)
            });
            let stream: HoldExpiryStream = Box::pin(stream);
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_keys_round_trip_through_parse() {
        let reservation_id = ReservationId::new();
        let key = RedisHoldTimers::key(&SkuId::new("drop:2025:shoes"), reservation_id);
        let parsed = RedisHoldTimers::parse_key(&key);
        assert_eq!(
            parsed,
            Some(HoldExpiry {
                sku_id: SkuId::new("drop:2025:shoes"),
                reservation_id,
            })
        );
    }

    #[test]
    fn foreign_keys_are_ignored() {
        assert_eq!(RedisHoldTimers::parse_key("session:abc"), None);
        assert_eq!(RedisHoldTimers::parse_key("flashsale:availability:console"), None);
        assert_eq!(RedisHoldTimers::parse_key("flashsale:hold:console:not-a-uuid"), None);
        assert_eq!(
            RedisHoldTimers::parse_key(&format!("flashsale:hold::{}", Uuid::new_v4())),
            None
        );
    }
}
