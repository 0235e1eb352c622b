//! Redis-backed availability cache.

use crate::{KEY_PREFIX, command_error, connect, ttl_millis};
use flashsale_core::cache::{AvailabilityCache, CacheError};
use flashsale_core::types::{Availability, SkuId};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Availability cache on Redis `GET` / `SET PX` / `DEL`.
#[derive(Clone)]
pub struct RedisAvailabilityCache {
    conn_manager: ConnectionManager,
}

impl RedisAvailabilityCache {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Connection`] if Redis cannot be reached.
    pub async fn new(redis_url: &str) -> Result<Self, CacheError> {
        let (_, conn_manager) = connect(redis_url).await?;
        Ok(Self { conn_manager })
    }

    /// Wrap an existing connection manager
    #[must_use]
    pub const fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    /// Redis key for a SKU's cached availability
    #[must_use]
    pub fn key(sku_id: &SkuId) -> String {
        format!("{KEY_PREFIX}:availability:{sku_id}")
    }
}

impl std::fmt::Debug for RedisAvailabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAvailabilityCache").finish_non_exhaustive()
    }
}

impl AvailabilityCache for RedisAvailabilityCache {
    fn get(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Availability>, CacheError>> + Send + '_>> {
        let key = Self::key(sku_id);
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let bytes: Option<Vec<u8>> = conn.get(&key).await.map_err(|e| command_error(&e))?;
            bytes
                .map(|bytes| {
                    bincode::deserialize(&bytes).map_err(|e| CacheError::Decode(e.to_string()))
                })
                .transpose()
        })
    }

    fn put(
        &self,
        sku_id: &SkuId,
        availability: Availability,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let key = Self::key(sku_id);
        Box::pin(async move {
            let bytes =
                bincode::serialize(&availability).map_err(|e| CacheError::Decode(e.to_string()))?;
            let mut conn = self.conn_manager.clone();
            let () = conn
                .pset_ex(&key, bytes, ttl_millis(ttl))
                .await
                .map_err(|e| command_error(&e))?;
            Ok(())
        })
    }

    fn invalidate(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let key = Self::key(sku_id);
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: u64 = conn.del(&key).await.map_err(|e| command_error(&e))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_keys_are_namespaced_per_sku() {
        assert_eq!(
            RedisAvailabilityCache::key(&SkuId::new("console")),
            "flashsale:availability:console"
        );
    }
}
