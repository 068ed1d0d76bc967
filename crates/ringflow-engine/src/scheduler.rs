//! Periodic campaign scheduler.
//!
//! Every tick the scheduler turns eligible targets of in-progress campaigns
//! into dispatch work. Order of operations per tick:
//!
//! 1. Retry-fairness gate: if any retry tier holds unprocessed messages,
//!    emit nothing this tick so retry workers dominate the dispatch topic
//!    until drained.
//! 2. Load in-progress campaigns (bounded batch) and drop those outside
//!    their business-hour window.
//! 3. Atomically claim pending targets (`pending -> queued`), oldest first.
//! 4. Trigger a call per claimed target; failed triggers revert their
//!    targets to `pending`.
//!
//! Ticks never overlap within a process. Multiple scheduler processes may
//! run concurrently: the atomic claim serializes them on the target rows,
//! so contention is possible but double-dispatch is not.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use ringflow_core::{CampaignStatus, TargetId};

use crate::bus::MessageBus;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::store::{CampaignStore, StatsStore, TargetStore};
use crate::topics::TopicSet;
use crate::trigger::{CallTrigger, TriggerCallInput, TriggerOrigin};
use crate::window::campaign_within_hours;

/// Outcome of one scheduler tick, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Tick aborted because a retry tier had pending work.
    pub skipped_for_retries: bool,
    /// In-progress campaigns examined.
    pub campaigns_seen: usize,
    /// Campaigns skipped for being outside their window.
    pub outside_window: usize,
    /// Targets claimed.
    pub claimed: usize,
    /// Calls successfully triggered.
    pub dispatched: usize,
    /// Claimed targets reverted to pending after trigger failure.
    pub reverted: usize,
}

/// Periodic scheduler converting targets into dispatch work.
pub struct CampaignScheduler {
    config: SchedulerConfig,
    campaigns: Arc<dyn CampaignStore>,
    targets: Arc<dyn TargetStore>,
    bus: Arc<dyn MessageBus>,
    topics: TopicSet,
    trigger: Arc<CallTrigger>,
    metrics: EngineMetrics,
}

impl CampaignScheduler {
    /// Builds a scheduler over the metadata store and message bus.
    pub fn new<M>(
        config: SchedulerConfig,
        metadata: Arc<M>,
        bus: Arc<dyn MessageBus>,
        topics: TopicSet,
        trigger: Arc<CallTrigger>,
    ) -> Self
    where
        M: CampaignStore + TargetStore + StatsStore + 'static,
    {
        Self {
            config,
            campaigns: metadata.clone(),
            targets: metadata,
            bus,
            topics,
            trigger,
            metrics: EngineMetrics::new(),
        }
    }

    /// Runs the tick loop until cancelled. The first tick fires immediately.
    ///
    /// # Errors
    ///
    /// Only cancellation ends the loop; per-tick errors are logged and the
    /// loop continues.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let interval = if self.config.tick_interval.is_zero() {
            std::time::Duration::from_secs(60)
        } else {
            self.config.tick_interval
        };

        loop {
            match self.tick().await {
                Ok(summary) => {
                    tracing::info!(
                        skipped_for_retries = summary.skipped_for_retries,
                        campaigns = summary.campaigns_seen,
                        outside_window = summary.outside_window,
                        claimed = summary.claimed,
                        dispatched = summary.dispatched,
                        reverted = summary.reverted,
                        "scheduler tick finished"
                    );
                }
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Executes one tick.
    ///
    /// # Errors
    ///
    /// Returns an error only when the campaign listing itself fails;
    /// per-campaign errors are logged and isolated.
    pub async fn tick(&self) -> Result<TickSummary> {
        let _timing = crate::metrics::time_scheduler_tick();
        let mut summary = TickSummary::default();

        // Failed calls are retried before new calls are dispatched. One
        // pending retry anywhere parks every campaign for this tick.
        if self.retries_pending().await {
            summary.skipped_for_retries = true;
            tracing::info!("retry tiers have pending work, skipping new dispatch this tick");
            return Ok(summary);
        }

        let now = Utc::now();
        let campaigns = self
            .campaigns
            .list_by_status(CampaignStatus::InProgress, self.config.campaign_fetch_limit())
            .await?;
        summary.campaigns_seen = campaigns.len();

        for campaign in campaigns {
            let span = ringflow_core::observability::scheduler_span(
                "schedule_campaign",
                &campaign.id.to_string(),
            );
            async {
                if !campaign_within_hours(now, &campaign) {
                    summary.outside_window += 1;
                    tracing::debug!("campaign outside business hours");
                    return;
                }

                let claimed = match self
                    .targets
                    .claim_batch(campaign.id, self.config.max_batch_size, now)
                    .await
                {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to claim targets");
                        return;
                    }
                };
                if claimed.is_empty() {
                    return;
                }
                summary.claimed += claimed.len();
                self.metrics.record_claimed(claimed.len());

                let mut failed: Vec<TargetId> = Vec::new();
                for target in claimed {
                    let input = TriggerCallInput {
                        campaign_id: campaign.id,
                        phone_number: target.phone_number.clone(),
                        metadata: target.payload.clone(),
                        origin: TriggerOrigin::Scheduler,
                    };
                    match self.trigger.trigger_call(input).await {
                        Ok(call) => {
                            summary.dispatched += 1;
                            self.metrics.record_dispatch("published");
                            tracing::debug!(call_id = %call.id, "call dispatched");
                        }
                        Err(e) => {
                            failed.push(target.id);
                            self.metrics.record_dispatch("failed");
                            tracing::error!(error = %e, "trigger failed for claimed target");
                        }
                    }
                }

                if !failed.is_empty() {
                    summary.reverted += failed.len();
                    if let Err(e) = self
                        .targets
                        .set_state(campaign.id, &failed, ringflow_core::TargetState::Pending)
                        .await
                    {
                        tracing::error!(error = %e, "failed to revert claimed targets");
                    }
                }
            }
            .instrument(span)
            .await;
        }

        Ok(summary)
    }

    /// Probes every retry tier for unprocessed messages.
    ///
    /// Probe failures count as "no pending work": a broken probe must not
    /// freeze all new dispatch indefinitely.
    async fn retries_pending(&self) -> bool {
        for (index, topic) in self.topics.retry.iter().enumerate() {
            let group = self.topics.retry_tier_consumer_group(index + 1);
            match self.bus.has_pending(topic, &group).await {
                Ok(true) => {
                    tracing::debug!(topic, "retry tier has pending messages");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(topic, error = %e, "failed to probe retry tier");
                }
            }
        }
        false
    }
}
