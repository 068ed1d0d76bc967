//! End-to-end pipeline tests over the in-memory backends.
//!
//! Each test stands up the full engine — scheduler, call workers, status
//! worker, retry workers — against the in-memory broker, stores, and slot
//! limiter, then drives scheduler ticks and observes the durable outcome.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ringflow_core::{CallStatus, CampaignId, CampaignStats, RetryPolicy, TargetState};
use ringflow_engine::bus::memory::InMemoryBroker;
use ringflow_engine::bus::MessageBus;
use ringflow_engine::config::{KafkaConfig, SchedulerConfig};
use ringflow_engine::error::Result;
use ringflow_engine::lifecycle::{CampaignLifecycle, CreateCampaignInput, TargetInput};
use ringflow_engine::messages::DispatchMessage;
use ringflow_engine::scheduler::CampaignScheduler;
use ringflow_engine::store::memory::{InMemoryCallStore, InMemoryMetadataStore};
use ringflow_engine::store::{CallStore, StatsStore, TargetStore};
use ringflow_engine::telephony::{CallOutcome, Provider, ScriptedProvider};
use ringflow_engine::throttle::{InMemorySlotLimiter, SlotLimiter};
use ringflow_engine::topics::TopicSet;
use ringflow_engine::trigger::CallTrigger;
use ringflow_engine::worker::{CallWorker, RetryWorker, StatusWorker};

/// Provider that records its own peak concurrency while holding each call
/// open briefly.
#[derive(Debug, Default)]
struct GaugeProvider {
    in_flight: AtomicI64,
    max_seen: AtomicI64,
}

#[async_trait]
impl Provider for GaugeProvider {
    async fn place_call(&self, _msg: &DispatchMessage) -> Result<CallOutcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(CallOutcome::completed(Duration::from_millis(80)))
    }

    fn name(&self) -> &str {
        "gauge"
    }
}

struct Pipeline {
    metadata: Arc<InMemoryMetadataStore>,
    calls: Arc<InMemoryCallStore>,
    bus: Arc<InMemoryBroker>,
    topics: TopicSet,
    scheduler: CampaignScheduler,
    lifecycle: CampaignLifecycle,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Builds the engine and spawns `call_workers` call workers plus the
    /// status and retry workers.
    fn start(provider: Arc<dyn Provider>, call_workers: usize) -> Self {
        Self::start_with_config(provider, call_workers, SchedulerConfig::default())
    }

    fn start_with_config(
        provider: Arc<dyn Provider>,
        call_workers: usize,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let calls = Arc::new(InMemoryCallStore::new());
        let bus = Arc::new(InMemoryBroker::new());
        let limiter = Arc::new(InMemorySlotLimiter::new());
        let topics = TopicSet::from_config(&KafkaConfig::default());
        let cancel = CancellationToken::new();

        let trigger = Arc::new(CallTrigger::new(
            metadata.clone(),
            calls.clone(),
            bus.clone(),
            topics.clone(),
            RetryPolicy::default(),
            10,
        ));
        let scheduler = CampaignScheduler::new(
            scheduler_config,
            metadata.clone(),
            bus.clone(),
            topics.clone(),
            trigger,
        );
        let lifecycle = CampaignLifecycle::new(metadata.clone(), RetryPolicy::default(), 10);

        for _ in 0..call_workers {
            let worker = Arc::new(CallWorker::new(
                bus.clone(),
                topics.clone(),
                limiter.clone() as Arc<dyn SlotLimiter>,
                provider.clone(),
                10,
                Duration::from_secs(5),
            ));
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(cancel).await });
        }

        let status_worker = Arc::new(StatusWorker::new(
            bus.clone(),
            topics.clone(),
            metadata.clone(),
            calls.clone() as Arc<dyn CallStore>,
        ));
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { status_worker.run(cancel).await });
        }

        let retry_worker = Arc::new(RetryWorker::new(bus.clone(), topics.clone()));
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { retry_worker.run(cancel).await });
        }

        Self {
            metadata,
            calls,
            bus,
            topics,
            scheduler,
            lifecycle,
            cancel,
        }
    }

    /// Creates and starts a 24x7 campaign with the given policy and targets.
    async fn campaign(&self, policy: RetryPolicy, phones: &[&str]) -> CampaignId {
        let campaign = self
            .lifecycle
            .create(CreateCampaignInput {
                name: format!("pipeline-{}", CampaignId::generate()),
                description: String::new(),
                timezone: "UTC".into(),
                max_concurrent_calls: 2,
                retry_policy: Some(policy),
                business_hours: Vec::new(),
                targets: phones
                    .iter()
                    .map(|p| TargetInput {
                        phone_number: (*p).to_string(),
                        payload: None,
                    })
                    .collect(),
            })
            .await
            .unwrap();
        self.lifecycle.start(campaign.id).await.unwrap();
        campaign.id
    }

    /// Polls the stats row until `predicate` holds or five seconds pass.
    async fn wait_for_stats<F>(&self, campaign_id: CampaignId, predicate: F) -> CampaignStats
    where
        F: Fn(&CampaignStats) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = StatsStore::get(&*self.metadata, campaign_id).await.unwrap();
            if predicate(&stats) {
                return stats;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for stats, last seen: {stats:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fast retry policy so tests spend milliseconds, not seconds, in tiers.
fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(40),
        max_delay: Duration::from_millis(160),
        jitter: 0.0,
    }
}

#[tokio::test]
async fn happy_path_one_target_completes() {
    let provider = Arc::new(ScriptedProvider::new([CallOutcome::completed(
        Duration::from_millis(500),
    )]));
    let pipeline = Pipeline::start(provider, 1);
    let campaign_id = pipeline.campaign(fast_policy(3), &["+15550100"]).await;

    let summary = pipeline.scheduler.tick().await.unwrap();
    assert_eq!(summary.dispatched, 1);

    let stats = pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 1)
        .await;
    assert_eq!(stats.total_calls, 1);
    assert_eq!(stats.pending_calls, 0);
    assert_eq!(stats.failed_calls, 0);
    assert_eq!(stats.retries_scheduled, 0);

    let calls = pipeline
        .calls
        .list_calls_by_campaign(campaign_id, 10)
        .await
        .unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].status, CallStatus::Completed);
    assert_eq!(calls[0].attempt_count, 1);

    let attempts = pipeline.calls.list_attempts(calls[0].id).await.unwrap();
    assert_eq!(attempts.len(), 1);

    let targets = TargetStore::list_by_campaign(
        &*pipeline.metadata,
        campaign_id,
        Some(TargetState::Done),
        10,
    )
    .await
    .unwrap();
    assert_eq!(targets.len(), 1);
}

#[tokio::test]
async fn single_retry_then_success() {
    let provider = Arc::new(ScriptedProvider::new([
        CallOutcome::failed(Duration::from_millis(200), true, "busy"),
        CallOutcome::completed(Duration::from_millis(400)),
    ]));
    let pipeline = Pipeline::start(provider, 1);
    let campaign_id = pipeline.campaign(fast_policy(3), &["+15550100"]).await;

    pipeline.scheduler.tick().await.unwrap();

    let stats = pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 1)
        .await;
    assert_eq!(stats.total_calls, 1);
    assert_eq!(stats.pending_calls, 0);
    assert_eq!(stats.retries_scheduled, 1);

    let calls = pipeline
        .calls
        .list_calls_by_campaign(campaign_id, 10)
        .await
        .unwrap();
    let call = &calls[0];
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.attempt_count, 2);

    // Exactly one attempt row per attempt number.
    let attempts = pipeline.calls.list_attempts(call.id).await.unwrap();
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_num).collect();
    assert_eq!(numbers, vec![1, 2]);

    // The k-th retry produced exactly one extra dispatch: two in total.
    assert_eq!(pipeline.bus.depth(&pipeline.topics.dispatch).unwrap(), 2);
}

#[tokio::test]
async fn attempt_exhaustion_fails_terminally() {
    let provider = Arc::new(ScriptedProvider::new([
        CallOutcome::failed(Duration::from_millis(200), true, "busy"),
        CallOutcome::failed(Duration::from_millis(200), true, "busy again"),
    ]));
    let pipeline = Pipeline::start(provider, 1);
    let campaign_id = pipeline.campaign(fast_policy(2), &["+15550100"]).await;

    pipeline.scheduler.tick().await.unwrap();

    let stats = pipeline
        .wait_for_stats(campaign_id, |s| s.failed_calls == 1)
        .await;
    assert_eq!(stats.total_calls, 1);
    assert_eq!(stats.pending_calls, 0);
    assert_eq!(stats.completed_calls, 0);
    assert_eq!(stats.retries_scheduled, 1);

    let calls = pipeline
        .calls
        .list_calls_by_campaign(campaign_id, 10)
        .await
        .unwrap();
    assert_eq!(calls[0].status, CallStatus::Failed);
    assert_eq!(calls[0].attempt_count, 2);

    let targets = TargetStore::list_by_campaign(
        &*pipeline.metadata,
        campaign_id,
        Some(TargetState::Failed),
        10,
    )
    .await
    .unwrap();
    assert_eq!(targets.len(), 1);

    // max_attempts = 2: exactly two dispatches ever, no third.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pipeline.bus.depth(&pipeline.topics.dispatch).unwrap(), 2);
}

#[tokio::test]
async fn concurrency_ceiling_holds_under_parallel_workers() {
    let provider = Arc::new(GaugeProvider::default());
    let pipeline = Pipeline::start(provider.clone(), 3);
    let campaign_id = pipeline
        .campaign(fast_policy(1), &["+15550101", "+15550102", "+15550103"])
        .await;

    pipeline.scheduler.tick().await.unwrap();

    pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 3)
        .await;

    // max_concurrent_calls = 2 on the campaign; three workers raced for it.
    assert!(
        provider.max_seen.load(Ordering::SeqCst) <= 2,
        "observed concurrency {} exceeded the ceiling",
        provider.max_seen.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn pending_retry_parks_new_dispatch_until_drained() {
    let provider = Arc::new(ScriptedProvider::new([
        // Attempt 1 of the seed call fails retryable, then everything
        // (its retry and the parked targets) succeeds.
        CallOutcome::failed(Duration::from_millis(100), true, "busy"),
    ]));
    // Batch size 1 so the first tick dispatches one target while the other
    // two stay pending behind the retry.
    let pipeline = Pipeline::start_with_config(
        provider,
        1,
        SchedulerConfig {
            max_batch_size: 1,
            ..SchedulerConfig::default()
        },
    );
    let campaign_id = pipeline
        .campaign(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_millis(250),
                jitter: 0.0,
            },
            &["+15550101", "+15550102", "+15550103"],
        )
        .await;

    let first = pipeline.scheduler.tick().await.unwrap();
    assert_eq!(first.dispatched, 1);

    // Wait until the failed attempt parked its retry on tier 1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let group = pipeline.topics.retry_tier_consumer_group(1);
        if pipeline
            .bus
            .has_pending(&pipeline.topics.retry[0], &group)
            .await
            .unwrap()
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "retry never queued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The tier still holds the delayed envelope: the tick must emit nothing.
    let parked = pipeline.scheduler.tick().await.unwrap();
    assert!(parked.skipped_for_retries);
    assert_eq!(parked.dispatched, 0);

    // Once the retry drains (delay elapses, worker republishes, commits),
    // new work resumes: with batch size 1, each following tick moves one
    // parked target.
    pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 1)
        .await;
    let resumed = pipeline.scheduler.tick().await.unwrap();
    assert!(!resumed.skipped_for_retries);
    assert_eq!(resumed.dispatched, 1);

    pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 2)
        .await;
    pipeline.scheduler.tick().await.unwrap();
    pipeline
        .wait_for_stats(campaign_id, |s| s.completed_calls == 3)
        .await;
}
