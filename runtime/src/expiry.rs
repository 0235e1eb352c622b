//! Reservation expiry.
//!
//! Three triggers release lapsed holds, all through [`ReleaseService::release`]:
//!
//! - [`HoldWatcher`]: fast path, reacts to hold timers firing
//! - [`ExpirySweeper`]: periodic ledger scan, the only trigger needed for
//!   correctness
//! - [`ExpiryReactor`]: consumes `reservation.expired` events and fans them out
//!   to [`ExpiryListener`]s
//!
//! Release is idempotent in the ledger (only `Reserved` rows past their
//! deadline transition), so triggers may overlap freely.

use crate::environment::EngineEnvironment;
use crate::metrics::ExpiryMetrics;
use crate::processed::ProcessedSet;
use crate::publisher::EventPublisher;
use crate::status::StatusBoard;
use flashsale_core::cache::{CacheError, HoldExpiryStream};
use flashsale_core::event::{RESERVATION_TOPIC, ReservationEvent};
use flashsale_core::event_bus::{EventBusError, EventStream};
use flashsale_core::ledger::LedgerError;
use flashsale_core::types::{ReservationId, ReservationRecord, SkuId};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Which trigger asked for a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseTrigger {
    /// A hold timer fired
    FastPath,
    /// The periodic sweep found the row
    Sweep,
    /// An expired event was observed on the bus
    Reactor,
}

impl ReleaseTrigger {
    /// Metric label
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FastPath => "fast_path",
            Self::Sweep => "sweep",
            Self::Reactor => "reactor",
        }
    }
}

/// The single release path shared by every trigger.
#[derive(Clone, Debug)]
pub struct ReleaseService {
    env: EngineEnvironment,
    publisher: EventPublisher,
}

impl ReleaseService {
    /// Release service over the engine's backends
    #[must_use]
    pub const fn new(env: EngineEnvironment, publisher: EventPublisher) -> Self {
        Self { env, publisher }
    }

    /// Expire `reservation_ids` of `sku_id` that are still held and past due.
    ///
    /// Returns the reservations actually released; rows already expired,
    /// confirmed or not yet due are skipped. Each released row invalidates the
    /// SKU's cached availability and produces one `reservation.expired` event.
    ///
    /// # Errors
    ///
    /// Returns the ledger error if the release transaction fails. Event
    /// publish failures are logged and do not fail the release.
    pub async fn release(
        &self,
        sku_id: &SkuId,
        reservation_ids: &[ReservationId],
        trigger: ReleaseTrigger,
    ) -> Result<Vec<ReservationRecord>, LedgerError> {
        if reservation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.env.clock.now();
        let released = self
            .env
            .ledger
            .apply_release(sku_id, reservation_ids, now)
            .await?;
        if released.is_empty() {
            return Ok(released);
        }

        if let Err(e) = self.env.cache.invalidate(sku_id).await {
            tracing::warn!(sku = %sku_id, error = %e, "Cache invalidation failed");
        }

        if trigger != ReleaseTrigger::FastPath {
            for reservation in &released {
                if let Err(e) = self
                    .env
                    .timers
                    .disarm(sku_id, reservation.reservation_id)
                    .await
                {
                    tracing::debug!(
                        reservation_id = %reservation.reservation_id,
                        error = %e,
                        "Failed to disarm hold timer"
                    );
                }
            }
        }

        for reservation in &released {
            // Publisher already logged and counted the failure
            let _ = self
                .publisher
                .publish(&ReservationEvent::expired(reservation, now))
                .await;
        }

        ExpiryMetrics::record_released(trigger.as_str(), released.len());
        tracing::info!(
            sku = %sku_id,
            trigger = trigger.as_str(),
            released = released.len(),
            "Released expired reservations"
        );
        Ok(released)
    }
}

/// Periodic ledger scan for lapsed holds, plus retention housekeeping.
#[derive(Clone, Debug)]
pub struct ExpirySweeper {
    env: EngineEnvironment,
    release: ReleaseService,
    processed: ProcessedSet,
    status: StatusBoard,
    batch_limit: usize,
    retention: Duration,
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations released, across all SKUs
    pub released: usize,
    /// Processed keys purged from the ledger
    pub purged_keys: u64,
}

impl ExpirySweeper {
    /// Sweeper releasing at most `batch_limit` rows per pass and keeping
    /// decided keys for `retention`.
    #[must_use]
    pub const fn new(
        env: EngineEnvironment,
        release: ReleaseService,
        processed: ProcessedSet,
        status: StatusBoard,
        batch_limit: usize,
        retention: Duration,
    ) -> Self {
        Self {
            env,
            release,
            processed,
            status,
            batch_limit,
            retention,
        }
    }

    /// Run one pass: release everything past due, then purge old keys.
    ///
    /// # Errors
    ///
    /// Returns the ledger error if the expired-row query fails. Per-SKU
    /// release failures are logged and left for the next pass.
    pub async fn sweep_once(&self) -> Result<SweepReport, LedgerError> {
        let now = self.env.clock.now();
        let expired = self.env.ledger.find_expired(now, self.batch_limit).await?;

        let mut by_sku: BTreeMap<SkuId, Vec<ReservationId>> = BTreeMap::new();
        for reservation in expired {
            by_sku
                .entry(reservation.sku_id)
                .or_default()
                .push(reservation.reservation_id);
        }

        let mut report = SweepReport::default();
        for (sku_id, ids) in by_sku {
            match self.release.release(&sku_id, &ids, ReleaseTrigger::Sweep).await {
                Ok(released) => report.released += released.len(),
                Err(e) => {
                    tracing::warn!(sku = %sku_id, error = %e, "Sweep release failed");
                }
            }
        }

        let cutoff = now
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        match self.env.ledger.purge_processed(cutoff).await {
            Ok(purged) => report.purged_keys = purged,
            Err(e) => tracing::warn!(error = %e, "Processed-key purge failed"),
        }
        self.processed.purge(cutoff);
        self.status.purge(cutoff);

        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` turns `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_ms = interval.as_millis(), "Expiry sweeper started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.released > 0 => {
                            tracing::debug!(released = report.released, "Sweep pass done");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Sweep pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Expiry sweeper stopped");
    }
}

/// Fast-path trigger: releases holds as their timers fire.
#[derive(Clone, Debug)]
pub struct HoldWatcher {
    env: EngineEnvironment,
    release: ReleaseService,
}

impl HoldWatcher {
    /// Watcher over the engine's hold timers
    #[must_use]
    pub const fn new(env: EngineEnvironment, release: ReleaseService) -> Self {
        Self { env, release }
    }

    /// Subscribe to fired timers.
    ///
    /// Done before spawning [`run`](Self::run) so no signal fired after
    /// `start` returns is missed.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the engine then relies on the sweep alone.
    pub async fn subscribe(&self) -> Result<HoldExpiryStream, CacheError> {
        self.env.timers.subscribe().await
    }

    /// Consume timer signals until shutdown or the stream ends.
    pub async fn run(self, mut fired: HoldExpiryStream, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Hold watcher started");

        while !*shutdown.borrow() {
            tokio::select! {
                next = fired.next() => {
                    let Some(expiry) = next else { break };
                    if let Err(e) = self
                        .release
                        .release(&expiry.sku_id, &[expiry.reservation_id], ReleaseTrigger::FastPath)
                        .await
                    {
                        tracing::warn!(
                            reservation_id = %expiry.reservation_id,
                            error = %e,
                            "Fast-path release failed, sweep will retry"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Hold watcher stopped");
    }
}

/// Downstream reaction to an expired reservation (notifications, analytics).
pub trait ExpiryListener: Send + Sync {
    /// Listener name for logs
    fn name(&self) -> &'static str;

    /// Handle one `reservation.expired` event.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; it is logged and the event is not
    /// redelivered.
    fn on_expired(
        &self,
        event: &ReservationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// Event-driven trigger: subscribes to `reservation.expired`.
///
/// Each event is passed through [`ReleaseService::release`] (a no-op when the
/// publisher already released the row) and then to every listener.
#[derive(Clone)]
pub struct ExpiryReactor {
    release: ReleaseService,
    publisher: EventPublisher,
    listeners: Vec<Arc<dyn ExpiryListener>>,
}

impl ExpiryReactor {
    /// Reactor with no listeners
    #[must_use]
    pub const fn new(release: ReleaseService, publisher: EventPublisher) -> Self {
        Self {
            release,
            publisher,
            listeners: Vec::new(),
        }
    }

    /// Add a listener
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ExpiryListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Handle one expired event.
    pub async fn handle(&self, event: &ReservationEvent) {
        let ReservationEvent::Expired {
            reservation_id,
            sku_id,
            ..
        } = event
        else {
            return;
        };

        if let Err(e) = self
            .release
            .release(sku_id, &[*reservation_id], ReleaseTrigger::Reactor)
            .await
        {
            tracing::warn!(reservation_id = %reservation_id, error = %e, "Reactor release failed");
        }

        for listener in &self.listeners {
            if let Err(reason) = listener.on_expired(event).await {
                tracing::warn!(
                    listener = listener.name(),
                    reservation_id = %reservation_id,
                    reason = %reason,
                    "Expiry listener failed"
                );
            }
        }
    }

    /// Subscribe to the reservation topic.
    ///
    /// # Errors
    ///
    /// Returns the bus error if the subscription cannot be created.
    pub async fn subscribe(&self) -> Result<EventStream, EventBusError> {
        self.publisher.bus().subscribe(&[RESERVATION_TOPIC]).await
    }

    /// React to expired events until shutdown or the stream ends.
    pub async fn run(self, mut events: EventStream, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(listeners = self.listeners.len(), "Expiry reactor started");

        while !*shutdown.borrow() {
            tokio::select! {
                next = events.next() => {
                    match next {
                        Some(Ok(serialized)) => {
                            if serialized.event_type != "reservation.expired" {
                                continue;
                            }
                            match serialized.decode::<ReservationEvent>() {
                                Ok(event) => self.handle(&event).await,
                                Err(e) => tracing::warn!(error = %e, "Undecodable expired event"),
                            }
                        }
                        Some(Err(e)) => tracing::warn!(error = %e, "Error receiving event from bus"),
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Expiry reactor stopped");
    }
}

impl std::fmt::Debug for ExpiryReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryReactor")
            .field(
                "listeners",
                &self.listeners.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_labels() {
        assert_eq!(ReleaseTrigger::FastPath.as_str(), "fast_path");
        assert_eq!(ReleaseTrigger::Sweep.as_str(), "sweep");
        assert_eq!(ReleaseTrigger::Reactor.as_str(), "reactor");
    }
}
