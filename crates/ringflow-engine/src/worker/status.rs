//! Status worker: durably reflects attempt outcomes in the stores and
//! routes retries into their delay tier.
//!
//! The store writes are not transactionally joined, and the status topic is
//! at-least-once, so every side effect is individually redelivery-safe:
//! the call-row update is guarded by the highest-applied-attempt marker,
//! attempt rows are upserts keyed by `(call_id, attempt_num)`, and counter
//! deltas only apply when the call row actually advanced. Retry routing is
//! deliberately *not* gated on that marker: a duplicate retry is corrected
//! downstream by the same guards, while a dropped retry would strand the
//! call.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use ringflow_core::{AttemptId, CallAttempt, CallStatus, StatsDelta, TargetState};

use crate::bus::{BusConsumer, Message, MessageBus, RetryRouter};
use crate::error::{Error, Result};
use crate::messages::StatusMessage;
use crate::metrics::EngineMetrics;
use crate::store::{CallStore, StatsStore, TargetStore};
use crate::topics::TopicSet;

/// Persists attempt outcomes and routes retries.
pub struct StatusWorker {
    bus: Arc<dyn MessageBus>,
    topics: TopicSet,
    calls: Arc<dyn CallStore>,
    targets: Arc<dyn TargetStore>,
    stats: Arc<dyn StatsStore>,
    router: RetryRouter,
    metrics: EngineMetrics,
}

impl StatusWorker {
    /// Builds a status worker.
    pub fn new<M>(
        bus: Arc<dyn MessageBus>,
        topics: TopicSet,
        metadata: Arc<M>,
        calls: Arc<dyn CallStore>,
    ) -> Self
    where
        M: TargetStore + StatsStore + 'static,
    {
        let router = RetryRouter::new(bus.clone(), topics.clone());
        Self {
            bus,
            topics,
            calls,
            targets: metadata.clone(),
            stats: metadata,
            router,
            metrics: EngineMetrics::new(),
        }
    }

    /// Consumes the status topic until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only when the consumer cannot be created.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let group = self.topics.status_consumer_group();
        let consumer = self.bus.consumer(&self.topics.status, &group).await?;

        loop {
            let msg = match consumer.fetch(&cancel).await {
                Ok(msg) => msg,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "status worker fetch failed");
                    continue;
                }
            };

            match self.process(&*consumer, &msg).await {
                Ok(()) => {}
                Err(e) => tracing::error!(error = %e, "status worker failed to process message"),
            }
        }
    }

    async fn process(&self, consumer: &dyn BusConsumer, msg: &Message) -> Result<()> {
        let status: StatusMessage = match msg.decode() {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "undecodable status message");
                if let Err(dead_err) = self.router.dead_letter(&msg.key, &msg.payload).await {
                    tracing::error!(error = %dead_err, "failed to deadletter poison status");
                }
                return consumer.commit(msg).await;
            }
        };

        let span = ringflow_core::observability::worker_span(
            "call.status",
            &status.campaign_id.to_string(),
            &status.call_id.to_string(),
            status.attempt,
        );

        async {
            self.metrics.record_attempt(status.status.as_str());

            // 1. Call row, guarded by the highest-applied-attempt marker.
            let row_status = if status.status == CallStatus::Failed && status.retryable {
                CallStatus::Retrying
            } else {
                status.status
            };
            let applied = match self
                .calls
                .update_call_status(
                    status.call_id,
                    row_status,
                    status.attempt,
                    status.error.as_deref(),
                    status.occurred_at,
                )
                .await
            {
                Ok(applied) => applied,
                Err(Error::NotFound { .. }) => {
                    tracing::warn!("status for unknown call, still recording attempt");
                    false
                }
                // Transient storage failure: leave the offset uncommitted.
                Err(e) => return Err(e),
            };

            // 2. Append-only attempt history; the key makes replays no-ops.
            let attempt = CallAttempt {
                id: AttemptId::generate(),
                call_id: status.call_id,
                attempt_num: status.attempt,
                status: status.status,
                error: status.error.clone(),
                duration: Duration::from_millis(
                    u64::try_from(status.duration_ms).unwrap_or(0),
                ),
                created_at: status.occurred_at,
            };
            self.calls.append_attempt(&attempt).await?;

            // 3. Counters and target state, only when this delivery advanced
            // the call row.
            if applied {
                let delta = Self::stats_delta(&status);
                if !delta.is_empty() {
                    if let Err(e) = self.stats.apply_delta(status.campaign_id, delta).await {
                        tracing::error!(error = %e, "failed to apply stats delta");
                    }
                }

                let terminal = match (status.status, status.retryable) {
                    (CallStatus::Completed, _) => Some(TargetState::Done),
                    (CallStatus::Failed, false) => Some(TargetState::Failed),
                    _ => None,
                };
                if let Err(e) = self
                    .targets
                    .record_outcome(
                        status.campaign_id,
                        &status.phone_number,
                        terminal,
                        status.occurred_at,
                    )
                    .await
                {
                    tracing::error!(error = %e, "failed to record target outcome");
                }
            }

            // 4. Retry routing; commit only after the retry is durably on
            // its tier.
            if status.retryable && status.next_attempt.is_some() {
                if let Some(retry) = status.to_retry() {
                    let tier = self.router.schedule(status.attempt, &retry).await?;
                    self.metrics.record_retry(tier);
                }
            }

            // 5. Offset.
            consumer.commit(msg).await
        }
        .instrument(span)
        .await
    }

    /// Derives the counter delta for one applied outcome.
    fn stats_delta(status: &StatusMessage) -> StatsDelta {
        let mut delta = StatsDelta::default();
        if status.attempt > 1 {
            delta.retries_scheduled += 1;
        }
        match status.status {
            CallStatus::Completed => {
                delta.completed_calls += 1;
                delta.pending_calls -= 1;
            }
            CallStatus::Failed if !status.retryable => {
                delta.failed_calls += 1;
                delta.pending_calls -= 1;
            }
            // Retryable failures stay pending until terminal.
            _ => {}
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use crate::config::KafkaConfig;
    use crate::store::memory::{InMemoryCallStore, InMemoryMetadataStore};
    use chrono::Utc;
    use ringflow_core::{Call, CallId, CampaignId};

    fn topics() -> TopicSet {
        TopicSet::from_config(&KafkaConfig::default())
    }

    struct Fixture {
        bus: Arc<InMemoryBroker>,
        metadata: Arc<InMemoryMetadataStore>,
        calls: Arc<InMemoryCallStore>,
        worker: StatusWorker,
        campaign_id: CampaignId,
        call_id: CallId,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBroker::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let calls = Arc::new(InMemoryCallStore::new());
        let campaign_id = CampaignId::generate();
        StatsStore::ensure(&*metadata, campaign_id).await.unwrap();

        let now = Utc::now();
        let call = Call {
            id: CallId::generate(),
            campaign_id,
            phone_number: "+15550100".into(),
            status: CallStatus::Queued,
            attempt_count: 0,
            last_attempt_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        calls.create_call(&call).await.unwrap();
        // Pretend the trigger already counted this call.
        StatsStore::apply_delta(&*metadata, campaign_id, StatsDelta::dispatched())
            .await
            .unwrap();

        let worker = StatusWorker::new(bus.clone(), topics(), metadata.clone(), calls.clone());
        Fixture {
            bus,
            metadata,
            calls,
            worker,
            campaign_id,
            call_id: call.id,
        }
    }

    fn status_msg(f: &Fixture, attempt: u32, status: CallStatus, retryable: bool) -> StatusMessage {
        StatusMessage {
            call_id: f.call_id,
            campaign_id: f.campaign_id,
            phone_number: "+15550100".into(),
            status,
            attempt,
            max_attempts: 3,
            retryable,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
            retry_jitter: 0.0,
            concurrency_limit: 2,
            duration_ms: 700,
            error: (status == CallStatus::Failed).then(|| "busy".to_string()),
            occurred_at: Utc::now(),
            next_attempt: retryable.then(Utc::now),
            metadata: None,
        }
    }

    async fn deliver(f: &Fixture, msg: &StatusMessage) {
        let payload = serde_json::to_vec(msg).unwrap();
        f.bus
            .publish(&topics().status, msg.partition_key(), &payload)
            .await
            .unwrap();
        let group = topics().status_consumer_group();
        let consumer = f.bus.consumer(&topics().status, &group).await.unwrap();
        let cancel = CancellationToken::new();
        let fetched = consumer.fetch(&cancel).await.unwrap();
        f.worker.process(&*consumer, &fetched).await.unwrap();
    }

    #[tokio::test]
    async fn completed_outcome_settles_counters_and_history() {
        let f = fixture().await;
        deliver(&f, &status_msg(&f, 1, CallStatus::Completed, false)).await;

        let stats = StatsStore::get(&*f.metadata, f.campaign_id).await.unwrap();
        assert_eq!(stats.completed_calls, 1);
        assert_eq!(stats.pending_calls, 0);
        assert_eq!(stats.retries_scheduled, 0);

        let call = f.calls.get_call(f.call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.attempt_count, 1);

        let attempts = f.calls.list_attempts(f.call_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_num, 1);
    }

    #[tokio::test]
    async fn retryable_failure_routes_to_tier_and_keeps_pending() {
        let f = fixture().await;
        deliver(&f, &status_msg(&f, 1, CallStatus::Failed, true)).await;

        let stats = StatsStore::get(&*f.metadata, f.campaign_id).await.unwrap();
        // Still pending; not failed yet.
        assert_eq!(stats.pending_calls, 1);
        assert_eq!(stats.failed_calls, 0);

        // First retry lands on tier 1.
        assert!(f
            .bus
            .has_pending(&topics().retry[0], "probe")
            .await
            .unwrap());

        let call = f.calls.get_call(f.call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Retrying);
    }

    #[tokio::test]
    async fn terminal_failure_counts_failed() {
        let f = fixture().await;
        deliver(&f, &status_msg(&f, 2, CallStatus::Failed, false)).await;

        let stats = StatsStore::get(&*f.metadata, f.campaign_id).await.unwrap();
        assert_eq!(stats.failed_calls, 1);
        assert_eq!(stats.pending_calls, 0);
        // attempt 2 counts one scheduled retry.
        assert_eq!(stats.retries_scheduled, 1);

        // No retry envelope was produced.
        assert!(!f
            .bus
            .has_pending(&topics().retry[0], "probe")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn replayed_status_does_not_double_count() {
        let f = fixture().await;
        let msg = status_msg(&f, 1, CallStatus::Completed, false);
        deliver(&f, &msg).await;
        deliver(&f, &msg).await; // redelivery

        let stats = StatsStore::get(&*f.metadata, f.campaign_id).await.unwrap();
        assert_eq!(stats.completed_calls, 1);
        assert_eq!(stats.pending_calls, 0);

        let attempts = f.calls.list_attempts(f.call_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn poison_status_is_deadlettered() {
        let f = fixture().await;
        f.bus
            .publish(&topics().status, b"key", b"garbage")
            .await
            .unwrap();
        let group = topics().status_consumer_group();
        let consumer = f.bus.consumer(&topics().status, &group).await.unwrap();
        let cancel = CancellationToken::new();
        let fetched = consumer.fetch(&cancel).await.unwrap();
        f.worker.process(&*consumer, &fetched).await.unwrap();

        assert!(f
            .bus
            .has_pending(&topics().deadletter, "probe")
            .await
            .unwrap());
        assert!(!f.bus.has_pending(&topics().status, &group).await.unwrap());
    }
}
