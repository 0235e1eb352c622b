//! Event bus abstraction for the reservation audit stream.
//!
//! The allocator and the expiry subsystem publish [`SerializedEvent`]s to the
//! bus after the ledger commit succeeded; reactors subscribe to it.
//!
//! ```text
//! ┌─────────────────┐
//! │ 1. Ledger commit│◄─── Source of truth
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ 2. Publish to   │
//! │    Event Bus    │◄─── At-least-once delivery
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┐
//!     ▼          ▼
//! ┌────────┐ ┌─────────┐
//! │Reactors│ │ Audit   │
//! └────────┘ └─────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Ledger first**: nothing is published before the ledger commit
//! - **At-least-once delivery**: a replayed batch may publish an event twice
//! - **Ordered within partition**: events are keyed by SKU
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `flashsale-testing`
//! - `RedpandaEventBus` in `flashsale-redpanda`

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Subscriber fell behind and missed events
    #[error("Subscriber lagged, {0} events skipped")]
    Lagged(u64),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of events from subscriptions.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so that it can be held as
/// `Arc<dyn EventBus>` by every SKU worker.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic, partitioned by `event.key`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// Only events published after the subscription are delivered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>>;
}
