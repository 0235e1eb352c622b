//! Typed publishing of reservation events.

use crate::metrics::EventMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use flashsale_core::event::{Event, RESERVATION_TOPIC, ReservationEvent, SerializedEvent};
use flashsale_core::event_bus::{EventBus, EventBusError};
use std::sync::Arc;

/// Serializes [`ReservationEvent`]s and publishes them keyed by SKU.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
}

impl EventPublisher {
    /// Publisher over `bus`, retrying each event with `retry`
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryPolicy) -> Self {
        Self { bus, retry }
    }

    /// Underlying bus
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns the last bus error once retries are exhausted.
    pub async fn publish(&self, event: &ReservationEvent) -> Result<(), EventBusError> {
        let serialized = SerializedEvent::from_event(event)
            .map_err(|e| EventBusError::PublishFailed {
                topic: RESERVATION_TOPIC.to_string(),
                reason: e.to_string(),
            })?;

        let result = retry_with_backoff(&self.retry, "event_publish", || {
            self.bus.publish(RESERVATION_TOPIC, &serialized)
        })
        .await;

        match &result {
            Ok(()) => EventMetrics::record_publish(event.event_type()),
            Err(e) => {
                EventMetrics::record_publish_error();
                tracing::error!(
                    event_type = event.event_type(),
                    sku = %event.sku_id(),
                    error = %e,
                    "Failed to publish reservation event"
                );
            }
        }
        result
    }

    /// Publish events in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first event that could not be published.
    pub async fn publish_all(
        &self,
        events: impl IntoIterator<Item = ReservationEvent>,
    ) -> Result<(), EventBusError> {
        for event in events {
            self.publish(&event).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topic", &RESERVATION_TOPIC)
            .finish_non_exhaustive()
    }
}
