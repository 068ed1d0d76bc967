//! Retry worker: one consumer per delay tier.
//!
//! Each tier is a delay lane for the k-th retry. The worker holds a fetched
//! envelope until its `next_attempt` time (fetch order within a partition
//! equals schedule order for a single call, so the sleep never starves a
//! later message of the same call), then republishes the embedded dispatch
//! with a fresh `enqueued_at`. Envelopes whose attempt exceeds
//! `max_attempts` go to deadletter and are never republished.

use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bus::{BusConsumer, CallDispatcher, Message, MessageBus, RetryRouter};
use crate::error::{Error, Result};
use crate::messages::RetryMessage;
use crate::metrics::EngineMetrics;
use crate::topics::TopicSet;

/// Consumes the retry tiers and feeds due dispatches back into the
/// dispatch topic.
pub struct RetryWorker {
    bus: Arc<dyn MessageBus>,
    topics: TopicSet,
    dispatcher: CallDispatcher,
    router: RetryRouter,
    metrics: EngineMetrics,
}

impl RetryWorker {
    /// Builds a retry worker over the configured tiers.
    pub fn new(bus: Arc<dyn MessageBus>, topics: TopicSet) -> Self {
        let dispatcher = CallDispatcher::new(bus.clone(), topics.dispatch.clone());
        let router = RetryRouter::new(bus.clone(), topics.clone());
        Self {
            bus,
            topics,
            dispatcher,
            router,
            metrics: EngineMetrics::new(),
        }
    }

    /// Consumes every tier concurrently until cancelled.
    ///
    /// # Errors
    ///
    /// Returns the first consumer-creation error; per-message errors are
    /// logged and the tier keeps running.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.topics.retry.is_empty() {
            cancel.cancelled().await;
            return Ok(());
        }

        let tiers = self
            .topics
            .retry
            .iter()
            .enumerate()
            .map(|(index, topic)| self.consume_tier(index + 1, topic.clone(), cancel.clone()));
        try_join_all(tiers).await?;
        Ok(())
    }

    async fn consume_tier(
        &self,
        tier: usize,
        topic: String,
        cancel: CancellationToken,
    ) -> Result<()> {
        let group = self.topics.retry_tier_consumer_group(tier);
        let consumer = self.bus.consumer(&topic, &group).await?;
        tracing::info!(tier, topic, group, "retry tier consumer started");

        loop {
            let msg = match consumer.fetch(&cancel).await {
                Ok(msg) => msg,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!(tier, error = %e, "retry worker fetch failed");
                    continue;
                }
            };

            match self.process(tier, &*consumer, &msg, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => tracing::error!(tier, error = %e, "retry worker failed to process"),
            }
        }
    }

    async fn process(
        &self,
        tier: usize,
        consumer: &dyn BusConsumer,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let retry: RetryMessage = match msg.decode() {
            Ok(retry) => retry,
            Err(e) => {
                tracing::error!(tier, error = %e, "undecodable retry message");
                if let Err(dead_err) = self.router.dead_letter(&msg.key, &msg.payload).await {
                    tracing::error!(error = %dead_err, "failed to deadletter poison retry");
                }
                return consumer.commit(msg).await;
            }
        };

        let span = ringflow_core::observability::worker_span(
            "retry.dispatch",
            &retry.dispatch.campaign_id.to_string(),
            &retry.dispatch.call_id.to_string(),
            retry.dispatch.attempt,
        );

        async {
            // Exhausted envelopes are parked, never republished.
            if retry.dispatch.attempt > retry.dispatch.max_attempts {
                tracing::warn!(
                    tier,
                    attempt = retry.dispatch.attempt,
                    max_attempts = retry.dispatch.max_attempts,
                    "retry past attempt exhaustion, deadlettering"
                );
                self.router.dead_letter(&msg.key, &msg.payload).await?;
                self.metrics.record_deadletter();
                return consumer.commit(msg).await;
            }

            // Hold the lane until the scheduled time; cancellation leaves
            // the offset uncommitted so the envelope survives shutdown.
            let wait = retry.next_attempt - Utc::now();
            if let Ok(wait) = wait.to_std() {
                if !wait.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }

            let mut dispatch = retry.dispatch.clone();
            dispatch.enqueued_at = Utc::now();

            // No commit on publish failure: redelivery retries the whole
            // envelope, including the (now elapsed) delay.
            self.dispatcher.dispatch(&dispatch).await?;
            self.metrics.record_dispatch("republished");

            consumer.commit(msg).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use crate::config::KafkaConfig;
    use crate::messages::DispatchMessage;
    use chrono::Duration as ChronoDuration;
    use ringflow_core::{CallId, CampaignId};
    use std::time::Duration;

    fn topics() -> TopicSet {
        TopicSet::from_config(&KafkaConfig::default())
    }

    fn retry_msg(attempt: u32, max_attempts: u32, delay_ms: i64) -> RetryMessage {
        RetryMessage {
            dispatch: DispatchMessage {
                call_id: CallId::generate(),
                campaign_id: CampaignId::generate(),
                phone_number: "+15550100".into(),
                attempt,
                max_attempts,
                retry_base_ms: 1_000,
                retry_max_ms: 10_000,
                retry_jitter: 0.0,
                concurrency_limit: 2,
                metadata: None,
                enqueued_at: Utc::now(),
            },
            next_attempt: Utc::now() + ChronoDuration::milliseconds(delay_ms),
        }
    }

    async fn deliver(bus: &Arc<InMemoryBroker>, worker: &RetryWorker, msg: &RetryMessage) {
        let tier_topic = &topics().retry[0];
        let payload = serde_json::to_vec(msg).unwrap();
        bus.publish(tier_topic, msg.partition_key(), &payload)
            .await
            .unwrap();

        let group = topics().retry_tier_consumer_group(1);
        let consumer = bus.consumer(tier_topic, &group).await.unwrap();
        let cancel = CancellationToken::new();
        let fetched = consumer.fetch(&cancel).await.unwrap();
        worker
            .process(1, &*consumer, &fetched, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn due_retry_republishes_exactly_one_dispatch() {
        let bus = Arc::new(InMemoryBroker::new());
        let worker = RetryWorker::new(bus.clone(), topics());

        let msg = retry_msg(2, 3, -50); // already past due
        deliver(&bus, &worker, &msg).await;

        assert_eq!(bus.depth(&topics().dispatch).unwrap(), 1);

        let consumer = bus.consumer(&topics().dispatch, "inspect").await.unwrap();
        let cancel = CancellationToken::new();
        let fetched = consumer.fetch(&cancel).await.unwrap();
        let dispatch: DispatchMessage = fetched.decode().unwrap();
        assert_eq!(dispatch.attempt, 2);
        assert_eq!(dispatch.call_id, msg.dispatch.call_id);
        assert!(dispatch.enqueued_at >= msg.dispatch.enqueued_at);
    }

    #[tokio::test]
    async fn future_retry_waits_until_scheduled_time() {
        let bus = Arc::new(InMemoryBroker::new());
        let worker = RetryWorker::new(bus.clone(), topics());

        let started = std::time::Instant::now();
        let msg = retry_msg(2, 3, 80);
        deliver(&bus, &worker, &msg).await;

        assert!(started.elapsed() >= Duration::from_millis(70));
        assert_eq!(bus.depth(&topics().dispatch).unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_retry_goes_to_deadletter() {
        let bus = Arc::new(InMemoryBroker::new());
        let worker = RetryWorker::new(bus.clone(), topics());

        let msg = retry_msg(4, 3, -50); // attempt beyond max
        deliver(&bus, &worker, &msg).await;

        assert_eq!(bus.depth(&topics().dispatch).unwrap(), 0);
        assert_eq!(bus.depth(&topics().deadletter).unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_mid_wait_leaves_offset_uncommitted() {
        let bus = Arc::new(InMemoryBroker::new());
        let worker = RetryWorker::new(bus.clone(), topics());

        let tier_topic = topics().retry[0].clone();
        let group = topics().retry_tier_consumer_group(1);
        let msg = retry_msg(2, 3, 5_000); // far in the future
        let payload = serde_json::to_vec(&msg).unwrap();
        bus.publish(&tier_topic, msg.partition_key(), &payload)
            .await
            .unwrap();

        let consumer = bus.consumer(&tier_topic, &group).await.unwrap();
        let cancel = CancellationToken::new();
        let fetched = consumer.fetch(&cancel).await.unwrap();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };
        let err = worker
            .process(1, &*consumer, &fetched, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        canceller.await.unwrap();

        // Nothing was dispatched and the envelope is still pending.
        assert_eq!(bus.depth(&topics().dispatch).unwrap(), 0);
        assert!(bus.has_pending(&tier_topic, &group).await.unwrap());
    }
}
