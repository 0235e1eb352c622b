//! In-memory event bus.
//!
//! Publishes over a `tokio::sync::broadcast` channel and keeps every published
//! event so tests can assert on the full audit stream.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flashsale_core::event::{ReservationEvent, SerializedEvent};
use flashsale_core::event_bus::{EventBus, EventBusError, EventStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Broadcast-backed bus that records everything it publishes.
#[derive(Clone, Debug)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<(String, SerializedEvent)>,
    published: Arc<Mutex<Vec<(String, SerializedEvent)>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryEventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(8192);
        Self {
            sender,
            published: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(false)),
        }
    }

    /// Make every publish fail until reset
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Every event published so far, in order
    #[must_use]
    pub fn published(&self) -> Vec<SerializedEvent> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Published events decoded as reservation events
    #[must_use]
    pub fn reservation_events(&self) -> Vec<ReservationEvent> {
        self.published()
            .iter()
            .filter_map(|event| event.decode().ok())
            .collect()
    }

    /// Number of published events of `event_type`
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event.event_type == event_type)
            .count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        Box::pin(async move {
            if *self.failing.lock().unwrap() {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "injected failure".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.clone(), event.clone()));
            // No subscribers is not an error
            let _ = self.sender.send((topic, event));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let mut receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok((topic, event)) => {
                            if topics.contains(&topic) {
                                yield Ok(event);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(EventBusError::Lagged(skipped));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as EventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["wanted"]).await.unwrap();

        let skipped = SerializedEvent::new("x".into(), "sku".into(), vec![1]);
        let wanted = SerializedEvent::new("y".into(), "sku".into(), vec![2]);
        bus.publish("other", &skipped).await.unwrap();
        bus.publish("wanted", &wanted).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received, wanted);
        assert_eq!(bus.published().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_reported() {
        let bus = InMemoryEventBus::new();
        bus.set_failing(true);
        let event = SerializedEvent::new("x".into(), "sku".into(), vec![]);
        assert!(bus.publish("t", &event).await.is_err());
        assert!(bus.published().is_empty());
    }
}
