//! Message-log abstraction and typed publishers.
//!
//! This module provides:
//!
//! - [`MessageBus`]: Trait over a partitioned, at-least-once message log
//!   with consumer groups
//! - [`BusConsumer`]: One consumer-group membership with fetch/commit
//! - [`CallDispatcher`], [`StatusPublisher`], [`RetryRouter`]: Typed
//!   publishers for the engine's closed message set
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: The same interface drives the in-memory broker in
//!   tests and Kafka in production
//! - **Commit-after-effect**: Consumers commit an offset only after the
//!   action the message represents is durably reflected downstream
//! - **Keyed ordering**: Publishers key every message with the 16 call-id
//!   bytes, so per-call order is preserved within each topic

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::messages::{DispatchMessage, RetryMessage, StatusMessage};
use crate::topics::TopicSet;

/// A raw message fetched from the log.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partition key.
    pub key: Vec<u8>,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Deserializes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed payloads; callers treat
    /// those as poison messages (commit, log, deadletter).
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Error::from)
    }
}

/// One consumer-group membership on a single topic.
///
/// Fetch blocks until a message is available or the token is cancelled.
/// Fetched-but-uncommitted messages are redelivered by the backend, so
/// processing must be idempotent.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Fetches the next message, blocking until one arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the token fires; transient backend
    /// failures surface as queue errors and may be retried by the caller.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message>;

    /// Commits the offset of a processed message.
    ///
    /// # Errors
    ///
    /// Returns a queue error when the commit cannot be durably recorded.
    async fn commit(&self, msg: &Message) -> Result<()>;
}

/// Partitioned, durable, at-least-once message log with consumer groups.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a keyed message, acknowledged durably before returning.
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()>;

    /// Joins a consumer group on a topic.
    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn BusConsumer>>;

    /// Probes whether the topic holds messages the group has not committed.
    ///
    /// Implemented as a broker-side size/offset comparison rather than a
    /// message peek, so it observes work regardless of delivery state.
    async fn has_pending(&self, topic: &str, group: &str) -> Result<bool>;

    /// Creates any missing topics from a `(name, partitions)` plan.
    async fn ensure_topics(&self, plan: &[(String, i32)]) -> Result<()>;
}

/// Publishes call dispatch instructions to the dispatch topic.
#[derive(Clone)]
pub struct CallDispatcher {
    bus: std::sync::Arc<dyn MessageBus>,
    topic: String,
}

impl CallDispatcher {
    /// Creates a dispatcher for the given topic.
    pub fn new(bus: std::sync::Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// Publishes one dispatch message, keyed by call id.
    ///
    /// # Errors
    ///
    /// Returns a queue error when the publish is not acknowledged.
    pub async fn dispatch(&self, msg: &DispatchMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.bus
            .publish(&self.topic, msg.partition_key(), &payload)
            .await
    }
}

/// Publishes attempt outcomes to the status topic.
#[derive(Clone)]
pub struct StatusPublisher {
    bus: std::sync::Arc<dyn MessageBus>,
    topic: String,
}

impl StatusPublisher {
    /// Creates a publisher for the given topic.
    pub fn new(bus: std::sync::Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// Publishes one status message, keyed by call id.
    ///
    /// # Errors
    ///
    /// Returns a queue error when the publish is not acknowledged.
    pub async fn publish(&self, msg: &StatusMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.bus
            .publish(&self.topic, msg.partition_key(), &payload)
            .await
    }
}

/// Routes retry envelopes into their delay tier, and exhausted or poisoned
/// envelopes to deadletter.
#[derive(Clone)]
pub struct RetryRouter {
    bus: std::sync::Arc<dyn MessageBus>,
    topics: TopicSet,
}

impl RetryRouter {
    /// Creates a router over the configured topic set.
    pub fn new(bus: std::sync::Arc<dyn MessageBus>, topics: TopicSet) -> Self {
        Self { bus, topics }
    }

    /// Schedules a retry: the envelope lands on tier
    /// `min(failed_attempt, N)`.
    ///
    /// `failed_attempt` is the 1-based attempt whose failure triggered the
    /// retry; the embedded dispatch already carries `attempt + 1`.
    ///
    /// # Errors
    ///
    /// Returns a queue error when no tier exists or the publish fails.
    pub async fn schedule(&self, failed_attempt: u32, msg: &RetryMessage) -> Result<usize> {
        let Some(topic) = self.topics.retry_topic_for_attempt(failed_attempt) else {
            return Err(Error::queue(format!(
                "no retry tier for attempt {failed_attempt}"
            )));
        };
        let tier = (failed_attempt as usize).min(self.topics.tier_count());
        let payload = serde_json::to_vec(msg)?;
        self.bus
            .publish(topic, msg.partition_key(), &payload)
            .await?;
        Ok(tier)
    }

    /// Parks a raw envelope on the deadletter topic for manual inspection.
    ///
    /// # Errors
    ///
    /// Returns a queue error when the publish fails.
    pub async fn dead_letter(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        self.bus
            .publish(&self.topics.deadletter, key, payload)
            .await
    }
}
