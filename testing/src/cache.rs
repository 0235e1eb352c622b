//! In-memory availability cache and hold timers.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use flashsale_core::cache::{
    AvailabilityCache, CacheError, HoldExpiry, HoldExpiryStream, HoldTimers,
};
use flashsale_core::environment::Clock;
use flashsale_core::types::{Availability, ReservationId, SkuId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// `RwLock<HashMap>` cache with per-entry deadlines.
///
/// `poison` plants an arbitrary value, which is how tests check that a wrong
/// cache never leaks into allocation decisions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAvailabilityCache {
    entries: Arc<RwLock<HashMap<SkuId, (Availability, Instant)>>>,
    invalidations: Arc<Mutex<u64>>,
}

impl InMemoryAvailabilityCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a value that stays for an hour, whatever the ledger says
    pub fn poison(&self, sku_id: &SkuId, availability: Availability) {
        self.entries.write().unwrap().insert(
            sku_id.clone(),
            (availability, Instant::now() + Duration::from_secs(3600)),
        );
    }

    /// Number of `invalidate` calls so far
    #[must_use]
    pub fn invalidations(&self) -> u64 {
        *self.invalidations.lock().unwrap()
    }

    /// Whether a live entry exists for the SKU
    #[must_use]
    pub fn contains(&self, sku_id: &SkuId) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(sku_id)
            .is_some_and(|(_, deadline)| *deadline > Instant::now())
    }
}

impl AvailabilityCache for InMemoryAvailabilityCache {
    fn get(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Availability>, CacheError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            let entries = self.entries.read().unwrap();
            Ok(entries
                .get(&sku_id)
                .filter(|(_, deadline)| *deadline > Instant::now())
                .map(|(availability, _)| *availability))
        })
    }

    fn put(
        &self,
        sku_id: &SkuId,
        availability: Availability,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            self.entries
                .write()
                .unwrap()
                .insert(sku_id, (availability, Instant::now() + ttl));
            Ok(())
        })
    }

    fn invalidate(
        &self,
        sku_id: &SkuId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let sku_id = sku_id.clone();
        Box::pin(async move {
            self.entries.write().unwrap().remove(&sku_id);
            *self.invalidations.lock().unwrap() += 1;
            Ok(())
        })
    }
}

/// Delay-queue hold timers: one sleeping task per armed reservation.
///
/// Deadlines are converted to delays with the injected clock, so under a
/// paused tokio runtime they fire when tokio time is advanced.
#[derive(Clone)]
pub struct InMemoryHoldTimers {
    clock: Arc<dyn Clock>,
    timers: Arc<Mutex<HashMap<ReservationId, JoinHandle<()>>>>,
    sender: broadcast::Sender<HoldExpiry>,
}

impl InMemoryHoldTimers {
    /// Create timers measured against `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self {
            clock,
            timers: Arc::new(Mutex::new(HashMap::new())),
            sender,
        }
    }

    /// Number of timers armed and not yet fired or disarmed
    #[must_use]
    pub fn armed(&self) -> usize {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|_, handle| !handle.is_finished());
        timers.len()
    }
}

impl std::fmt::Debug for InMemoryHoldTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryHoldTimers")
            .field("armed", &self.timers.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl HoldTimers for InMemoryHoldTimers {
    fn arm(
        &self,
        sku_id: &SkuId,
        reservation_id: ReservationId,
        expires_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        let expiry = HoldExpiry {
            sku_id: sku_id.clone(),
            reservation_id,
        };
        Box::pin(async move {
            let delay = (expires_at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let sender = self.sender.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // No subscribers is fine: the sweep is the backstop
                let _ = sender.send(expiry);
            });
            if let Some(previous) = self.timers.lock().unwrap().insert(reservation_id, handle) {
                previous.abort();
            }
            Ok(())
        })
    }

    fn disarm(
        &self,
        _sku_id: &SkuId,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(handle) = self.timers.lock().unwrap().remove(&reservation_id) {
                handle.abort();
            }
            Ok(())
        })
    }

    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<HoldExpiryStream, CacheError>> + Send + '_>> {
        let mut receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(expiry) => yield expiry,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as HoldExpiryStream)
        })
    }
}
