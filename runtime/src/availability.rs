//! Read-through availability view.

use crate::environment::EngineEnvironment;
use flashsale_core::ledger::LedgerError;
use flashsale_core::types::{Availability, SkuId};
use std::time::Duration;

/// Serves `get_availability` from the cache, falling back to the ledger.
///
/// Only this read path populates the cache. Allocation never reads it, so a
/// stale or wrong entry can mislead a shopper for at most one TTL but cannot
/// cause an oversell.
#[derive(Clone, Debug)]
pub struct AvailabilityView {
    env: EngineEnvironment,
    ttl: Duration,
}

impl AvailabilityView {
    /// View caching ledger reads for `ttl`
    #[must_use]
    pub const fn new(env: EngineEnvironment, ttl: Duration) -> Self {
        Self { env, ttl }
    }

    /// Current availability of a SKU.
    ///
    /// # Errors
    ///
    /// Returns the ledger error on a cache miss if the ledger read fails.
    /// Cache failures are logged and treated as misses.
    pub async fn get(&self, sku_id: &SkuId) -> Result<Availability, LedgerError> {
        match self.env.cache.get(sku_id).await {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(sku = %sku_id, error = %e, "Cache read failed, using ledger");
            }
        }

        let availability = self.env.ledger.inventory(sku_id).await?.availability();
        if let Err(e) = self.env.cache.put(sku_id, availability, self.ttl).await {
            tracing::warn!(sku = %sku_id, error = %e, "Cache fill failed");
        }
        Ok(availability)
    }
}
