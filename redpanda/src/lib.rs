//! Redpanda event bus for the flash-sale allocation engine.
//!
//! Implements [`EventBus`] on a Kafka-compatible broker through rdkafka, so the
//! same code runs against Redpanda, Apache Kafka or a managed service.
//!
//! # Partitioning
//!
//! Every record is keyed by [`SerializedEvent::key`], which the engine sets to
//! the SKU. All events for one SKU therefore land in one partition and are
//! consumed in commit order.
//!
//! # Delivery Semantics
//!
//! **At-least-once** on both ends:
//! - the engine republishes a batch's events when it replays that batch after a
//!   crash, so consumers see duplicates and must dedupe on reservation or
//!   request id
//! - the consumer commits an offset only after the event reached the
//!   subscriber's channel; a crash before the commit redelivers it
//!
//! # Example
//!
//! ```no_run
//! use flashsale_redpanda::RedpandaEventBus;
//! use flashsale_core::event::RESERVATION_TOPIC;
//! use flashsale_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("reservation-audit")
//!     .build()?;
//!
//! let mut events = bus.subscribe(&[RESERVATION_TOPIC]).await?;
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{} for {}", event.event_type, event.key);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use flashsale_core::event::SerializedEvent;
use flashsale_core::event_bus::{EventBus, EventBusError, EventStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACKS: &str = "all";
const DEFAULT_COMPRESSION: &str = "none";
const DEFAULT_OFFSET_RESET: &str = "latest";

/// [`EventBus`] backed by Redpanda.
///
/// The producer is idempotent and waits for all in-sync replicas by default:
/// reservation events feed audit and notifications, so a lost event is worse
/// than a slow one.
///
/// # Example
///
/// ```no_run
/// use flashsale_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::new("localhost:9092")?;
///
/// let tuned = RedpandaEventBus::builder()
///     .brokers("broker-1:9092,broker-2:9092")
///     .compression("lz4")
///     .timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Bus with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from `brokers`.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a bus
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers this bus talks to
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group for a subscription: the configured one, or one derived
    /// from the sorted topic names.
    fn group_for(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("flashsale-{}", sorted.join("-"))
        })
    }

    async fn send(&self, topic: String, event: SerializedEvent) -> Result<(), EventBusError> {
        let payload = bincode::serialize(&event).map_err(|e| EventBusError::PublishFailed {
            topic: topic.clone(),
            reason: format!("Failed to serialize event: {e}"),
        })?;

        let record = FutureRecord::to(&topic)
            .payload(&payload)
            .key(event.key.as_bytes());

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition,
                    offset,
                    event_type = %event.event_type,
                    key = %event.key,
                    "Event published"
                );
                Ok(())
            }
            Err((kafka_error, _)) => {
                tracing::warn!(
                    topic = %topic,
                    event_type = %event.event_type,
                    error = %kafka_error,
                    "Broker rejected event"
                );
                Err(EventBusError::PublishFailed {
                    topic,
                    reason: kafka_error.to_string(),
                })
            }
        }
    }

    async fn open_stream(&self, topics: Vec<String>) -> Result<EventStream, EventBusError> {
        let group = self.group_for(&topics);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: topics.clone(),
                reason: format!("Failed to create consumer: {e}"),
            })?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: topics.clone(),
                reason: format!("Failed to subscribe: {e}"),
            })?;

        tracing::info!(
            topics = ?topics,
            consumer_group = %group,
            buffer_size = self.buffer_size,
            auto_offset_reset = %self.auto_offset_reset,
            "Subscribed to topics"
        );

        let (tx, mut rx) = tokio::sync::mpsc::channel(self.buffer_size);
        tokio::spawn(async move {
            use futures::StreamExt;

            let mut messages = consumer.stream();
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        let err = EventBusError::TransportError(format!(
                            "Failed to receive message: {e}"
                        ));
                        if tx.send(Err(err)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                // Offsets are committed only once the subscriber has the event
                if tx.send(decode(&message)).await.is_err() {
                    tracing::debug!("Subscriber dropped, stopping consumer");
                    break;
                }
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        error = %e,
                        "Offset commit failed; event may be redelivered"
                    );
                }
            }
            tracing::debug!("Consumer task exiting");
        });

        let stream = async_stream::stream! {
            while let Some(result) = rx.recv().await {
                yield result;
            }
        };
        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for RedpandaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventBus")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .field("consumer_group", &self.consumer_group)
            .field("buffer_size", &self.buffer_size)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .finish_non_exhaustive()
    }
}

fn decode(message: &BorrowedMessage<'_>) -> Result<SerializedEvent, EventBusError> {
    let payload = message
        .payload()
        .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    let event: SerializedEvent = bincode::deserialize(payload).map_err(|e| {
        EventBusError::DeserializationFailed(format!("Failed to deserialize event: {e}"))
    })?;
    tracing::trace!(
        topic = message.topic(),
        partition = message.partition(),
        offset = message.offset(),
        event_type = %event.event_type,
        "Received event"
    );
    Ok(event)
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        Box::pin(self.send(topic.to_string(), event.clone()))
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, EventBusError>> + Send + '_>> {
        let topics = topics.iter().map(|s| (*s).to_string()).collect();
        Box::pin(self.open_stream(topics))
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Debug, Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated bootstrap servers
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer `acks`: `"0"`, `"1"` or `"all"` (default `"all"`).
    ///
    /// Anything but `"all"` turns producer idempotence off, which the broker
    /// requires.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a publish may wait for the broker (default 5s)
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every subscription of this bus.
    ///
    /// Without one, each subscription derives its group from its topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Events buffered between the consumer and the subscriber (default 1000).
    /// Zero is raised to one.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a new consumer group starts: `"earliest"` or `"latest"` (default)
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no brokers were set or
    /// rdkafka rejects the configuration.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let compression = self.compression.as_deref().unwrap_or(DEFAULT_COMPRESSION);
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let idempotent = acks == "all";

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", idempotent.to_string())
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            idempotent,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}
