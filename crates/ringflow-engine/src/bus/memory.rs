//! In-memory message broker for testing and development.
//!
//! Implements the full [`MessageBus`] contract the engine relies on:
//! keyed partitioning, per-partition FIFO, consumer groups with independent
//! offsets, and at-least-once redelivery of fetched-but-uncommitted
//! messages (via [`InMemoryBroker::rewind_uncommitted`], standing in for a
//! crashed worker whose offsets were never committed).
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, no distribution
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::{BusConsumer, Message, MessageBus};
use crate::error::{Error, Result};

/// Default partition count for topics created implicitly by a publish.
const IMPLICIT_PARTITIONS: i32 = 8;

/// Interval between queue re-checks while a fetch is parked.
///
/// Bounds the window of a missed wakeup between the emptiness check and the
/// notify await.
const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Vec<u8>,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct TopicState {
    partitions: Vec<Vec<StoredMessage>>,
}

impl TopicState {
    fn new(partitions: i32) -> Self {
        let count = usize::try_from(partitions.max(1)).unwrap_or(1);
        Self {
            partitions: (0..count).map(|_| Vec::new()).collect(),
        }
    }
}

/// Per-(group, partition) cursor state.
///
/// `delivered` is the next offset to hand out; `committed` is the next
/// uncommitted offset. `delivered > committed` means messages are in flight.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    delivered: i64,
    committed: i64,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    groups: HashMap<(String, String), Vec<Cursor>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::queue("broker lock poisoned")
}

/// In-memory partitioned broker with consumer groups.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages ever published to a topic, across partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn depth(&self, topic: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .topics
            .get(topic)
            .map_or(0, |t| t.partitions.iter().map(Vec::len).sum()))
    }

    /// Resets a group's delivery cursors back to its commits, making every
    /// uncommitted message fetchable again.
    ///
    /// Models a worker crash between fetch and commit; the pipeline tests
    /// use it to exercise redelivery idempotence.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn rewind_uncommitted(&self, topic: &str, group: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if let Some(cursors) = state.groups.get_mut(&(topic.to_string(), group.to_string())) {
            for cursor in cursors {
                cursor.delivered = cursor.committed;
            }
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    fn partition_for(key: &[u8], partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let hash = hasher.finish() as usize;
        hash % partitions.max(1)
    }
}

#[async_trait]
impl MessageBus for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<()> {
        {
            let mut state = self.state.write().map_err(poison_err)?;
            let topic_state = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState::new(IMPLICIT_PARTITIONS));
            let partition = Self::partition_for(key, topic_state.partitions.len());
            topic_state.partitions[partition].push(StoredMessage {
                key: key.to_vec(),
                payload: payload.to_vec(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn BusConsumer>> {
        {
            // Materialize the topic and group cursors up front so a probe
            // sees the group even before its first fetch.
            let mut state = self.state.write().map_err(poison_err)?;
            let partition_count = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicState::new(IMPLICIT_PARTITIONS))
                .partitions
                .len();
            state
                .groups
                .entry((topic.to_string(), group.to_string()))
                .or_insert_with(|| vec![Cursor::default(); partition_count]);
        }
        Ok(Box::new(InMemoryConsumer {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            topic: topic.to_string(),
            group: group.to_string(),
            next_partition: AtomicUsize::new(0),
        }))
    }

    async fn has_pending(&self, topic: &str, group: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        let Some(topic_state) = state.topics.get(topic) else {
            return Ok(false);
        };
        let key = (topic.to_string(), group.to_string());
        let cursors = state.groups.get(&key);
        for (partition, messages) in topic_state.partitions.iter().enumerate() {
            let committed = cursors
                .and_then(|c| c.get(partition))
                .map_or(0, |c| c.committed);
            if (messages.len() as i64) > committed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn ensure_topics(&self, plan: &[(String, i32)]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for (topic, partitions) in plan {
            state
                .topics
                .entry(topic.clone())
                .or_insert_with(|| TopicState::new(*partitions));
        }
        Ok(())
    }
}

/// One consumer-group membership on the in-memory broker.
#[derive(Debug)]
pub struct InMemoryConsumer {
    state: Arc<RwLock<BrokerState>>,
    notify: Arc<Notify>,
    topic: String,
    group: String,
    next_partition: AtomicUsize,
}

impl InMemoryConsumer {
    fn try_fetch(&self) -> Result<Option<Message>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let BrokerState { topics, groups } = &mut *state;
        let Some(topic_state) = topics.get(&self.topic) else {
            return Ok(None);
        };
        let partition_count = topic_state.partitions.len();
        let key = (self.topic.clone(), self.group.clone());
        let cursors = groups
            .entry(key)
            .or_insert_with(|| vec![Cursor::default(); partition_count]);

        // Round-robin across partitions for fairness; within one partition
        // delivery is strictly in offset order.
        let start = self.next_partition.fetch_add(1, Ordering::Relaxed);
        for i in 0..partition_count {
            let partition = (start + i) % partition_count;
            let cursor = &mut cursors[partition];
            let messages = &topic_state.partitions[partition];
            let offset = usize::try_from(cursor.delivered).unwrap_or(usize::MAX);
            if offset < messages.len() {
                let stored = &messages[offset];
                cursor.delivered += 1;
                #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
                return Ok(Some(Message {
                    topic: self.topic.clone(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BusConsumer for InMemoryConsumer {
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Message> {
        loop {
            if let Some(msg) = self.try_fetch()? {
                return Ok(msg);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = self.notify.notified() => {}
                () = tokio::time::sleep(FETCH_POLL_INTERVAL) => {}
            }
        }
    }

    async fn commit(&self, msg: &Message) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = (self.topic.clone(), self.group.clone());
        let cursors = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| Error::queue("commit for unknown consumer group"))?;
        let partition = usize::try_from(msg.partition)
            .ok()
            .filter(|p| *p < cursors.len())
            .ok_or_else(|| Error::queue("commit for unknown partition"))?;
        let cursor = &mut cursors[partition];
        cursor.committed = cursor.committed.max(msg.offset + 1);
        cursor.delivered = cursor.delivered.max(cursor.committed);
        Ok(())
    }
}
