//! Kafka message-bus backend.
//!
//! Production implementation of [`MessageBus`] over rdkafka. Publishes are
//! synchronous with `acks=all`; consumers disable auto-commit so offsets
//! move only after the worker has durably acted on a message.
//!
//! The pending probe compares each partition's high watermark against the
//! group's committed offset, the broker-side size metric the scheduler's
//! retry-fairness gate calls for. No message is fetched or committed by the
//! probe.
//!
//! This module is only compiled with the `kafka` feature:
//!
//! ```toml
//! [dependencies]
//! ringflow-engine = { version = "0.1", features = ["kafka"] }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;

use super::{BusConsumer, Message, MessageBus};
use crate::config::KafkaConfig;
use crate::error::{Error, Result};

/// Deadline for one synchronous publish acknowledgement.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for metadata/offset probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-backed message bus.
pub struct KafkaBus {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaBus {
    /// Connects a producer to the configured brokers.
    ///
    /// # Errors
    ///
    /// Returns a queue error when the producer cannot be constructed.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| Error::queue_with_source("create kafka producer", e))?;
        Ok(Self {
            producer,
            config: config.clone(),
        })
    }

    fn consumer_config(&self, group: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("client.id", &self.config.client_id)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        config
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(PUBLISH_TIMEOUT))
            .await
            .map_err(|(e, _)| Error::queue_with_source(format!("publish to {topic}"), e))?;
        Ok(())
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn BusConsumer>> {
        let consumer: StreamConsumer = self
            .consumer_config(group)
            .create()
            .map_err(|e| Error::queue_with_source("create kafka consumer", e))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| Error::queue_with_source(format!("subscribe to {topic}"), e))?;
        Ok(Box::new(KafkaBusConsumer { consumer }))
    }

    async fn has_pending(&self, topic: &str, group: &str) -> Result<bool> {
        let config = self.consumer_config(group);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || pending_probe(&config, &topic))
            .await
            .map_err(|e| Error::queue(format!("pending probe join: {e}")))?
    }

    async fn ensure_topics(&self, plan: &[(String, i32)]) -> Result<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", self.config.brokers.join(","))
            .set("client.id", &self.config.client_id)
            .create()
            .map_err(|e| Error::queue_with_source("create kafka admin client", e))?;

        let topics: Vec<NewTopic<'_>> = plan
            .iter()
            .map(|(name, partitions)| {
                NewTopic::new(name, (*partitions).max(1), TopicReplication::Fixed(1))
            })
            .collect();

        let results = admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .map_err(|e| Error::queue_with_source("create topics", e))?;

        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(Error::queue(format!("create topic {name}: {code}")));
                }
            }
        }
        Ok(())
    }
}

/// Blocking watermark-vs-committed comparison for one topic.
fn pending_probe(config: &ClientConfig, topic: &str) -> Result<bool> {
    let consumer: BaseConsumer = config
        .create()
        .map_err(|e| Error::queue_with_source("create probe consumer", e))?;

    let metadata = consumer
        .fetch_metadata(Some(topic), PROBE_TIMEOUT)
        .map_err(|e| Error::queue_with_source(format!("fetch metadata for {topic}"), e))?;
    let Some(topic_meta) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Ok(false);
    };

    let mut assignment = TopicPartitionList::new();
    for partition in topic_meta.partitions() {
        assignment
            .add_partition_offset(topic, partition.id(), Offset::Invalid)
            .map_err(|e| Error::queue_with_source("build probe assignment", e))?;
    }
    let committed = consumer
        .committed_offsets(assignment, PROBE_TIMEOUT)
        .map_err(|e| Error::queue_with_source(format!("committed offsets for {topic}"), e))?;

    for element in committed.elements() {
        let (low, high) = consumer
            .fetch_watermarks(topic, element.partition(), PROBE_TIMEOUT)
            .map_err(|e| Error::queue_with_source(format!("watermarks for {topic}"), e))?;
        let committed_offset = match element.offset() {
            Offset::Offset(n) => n,
            // Group has never committed on this partition.
            _ => low,
        };
        if high > committed_offset {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One Kafka consumer-group membership.
pub struct KafkaBusConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            received = self.consumer.recv() => {
                let msg = received
                    .map_err(|e| Error::queue_with_source("fetch message", e))?;
                Ok(Message {
                    topic: msg.topic().to_string(),
                    partition: msg.partition(),
                    offset: msg.offset(),
                    key: msg.key().unwrap_or_default().to_vec(),
                    payload: msg.payload().unwrap_or_default().to_vec(),
                })
            }
        }
    }

    async fn commit(&self, msg: &Message) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| Error::queue_with_source("build commit offsets", e))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| Error::queue_with_source("commit offsets", e))?;
        Ok(())
    }
}
