//! Call trigger service: the single path that turns a target (or an
//! operator request) into a persisted call plus a dispatch message.
//!
//! Both the scheduler and the administrative surface go through
//! [`CallTrigger::trigger_call`], so validation, stats accounting, and the
//! publish-failure compensation live in exactly one place.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use ringflow_core::{Call, CallId, CallStatus, CampaignId, RetryPolicy, StatsDelta};

use crate::bus::{CallDispatcher, MessageBus};
use crate::error::{Error, Result};
use crate::messages::DispatchMessage;
use crate::store::{CallStore, CampaignStore, StatsStore, TargetStore};
use crate::topics::TopicSet;

/// Where a trigger request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    /// Operator/administrative request; target membership is enforced.
    External,
    /// Scheduler claim; the claimed target row is the membership proof.
    Scheduler,
}

/// Arguments for triggering a call.
#[derive(Debug, Clone)]
pub struct TriggerCallInput {
    /// Campaign the call belongs to.
    pub campaign_id: CampaignId,
    /// Destination phone number.
    pub phone_number: String,
    /// Opaque metadata carried through dispatch unchanged.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Request origin.
    pub origin: TriggerOrigin,
}

/// Creates calls and enqueues their first attempt.
pub struct CallTrigger {
    campaigns: Arc<dyn CampaignStore>,
    targets: Arc<dyn TargetStore>,
    stats: Arc<dyn StatsStore>,
    calls: Arc<dyn CallStore>,
    dispatcher: CallDispatcher,
    default_retry: RetryPolicy,
    default_concurrency: i32,
}

impl CallTrigger {
    /// Builds the trigger service over a metadata store, the attempt store,
    /// and the message bus.
    pub fn new<M>(
        metadata: Arc<M>,
        calls: Arc<dyn CallStore>,
        bus: Arc<dyn MessageBus>,
        topics: TopicSet,
        default_retry: RetryPolicy,
        default_concurrency: i32,
    ) -> Self
    where
        M: CampaignStore + TargetStore + StatsStore + 'static,
    {
        Self {
            campaigns: metadata.clone(),
            targets: metadata.clone(),
            stats: metadata,
            calls,
            dispatcher: CallDispatcher::new(bus, topics.dispatch),
            default_retry,
            default_concurrency,
        }
    }

    /// Creates a call row, applies the `{total + 1, pending + 1}` delta, and
    /// publishes the first-attempt dispatch.
    ///
    /// If the publish fails the pending counter is reverted and the error
    /// surfaces to the caller, who owns any target-state compensation.
    ///
    /// # Errors
    ///
    /// - `Validation` when the phone number is empty, or (for external
    ///   triggers) not registered to the campaign
    /// - `NotFound` when the campaign does not exist
    /// - `Storage`/`Queue` when persistence or the publish fails
    pub async fn trigger_call(&self, input: TriggerCallInput) -> Result<Call> {
        if input.phone_number.is_empty() {
            return Err(Error::validation("phone number is required"));
        }

        let campaign = self.campaigns.get(input.campaign_id).await?;

        if input.origin == TriggerOrigin::External {
            let registered = self
                .targets
                .contains_phone(campaign.id, &input.phone_number)
                .await?;
            if !registered {
                return Err(Error::validation(
                    "phone number is not part of this campaign's registered target list",
                ));
            }
        }

        let mut policy = campaign.retry_policy.clone();
        if policy.validate().is_err() {
            policy = self.default_retry.clone();
        }
        let concurrency_limit = if campaign.max_concurrent_calls > 0 {
            campaign.max_concurrent_calls
        } else {
            self.default_concurrency
        };

        let now = Utc::now();
        let call = Call {
            id: CallId::generate(),
            campaign_id: campaign.id,
            phone_number: input.phone_number.clone(),
            status: CallStatus::Queued,
            attempt_count: 0,
            last_attempt_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        self.calls.create_call(&call).await?;

        self.stats
            .apply_delta(campaign.id, StatsDelta::dispatched())
            .await?;

        let payload =
            DispatchMessage::first_attempt(&call, &policy, concurrency_limit, input.metadata, now);

        if let Err(publish_err) = self.dispatcher.dispatch(&payload).await {
            // The call never made it onto the log; take back the pending
            // count so the counters stay truthful. The total count keeps the
            // created row visible for inspection.
            let revert = StatsDelta {
                pending_calls: -1,
                ..StatsDelta::default()
            };
            if let Err(revert_err) = self.stats.apply_delta(campaign.id, revert).await {
                tracing::error!(
                    campaign_id = %campaign.id,
                    error = %revert_err,
                    "failed to revert pending counter after dispatch failure"
                );
            }
            return Err(publish_err);
        }

        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use crate::config::KafkaConfig;
    use crate::store::memory::{InMemoryCallStore, InMemoryMetadataStore};
    use ringflow_core::{Campaign, CampaignStatus, CampaignTarget, TargetId, TargetState};

    fn topics() -> TopicSet {
        TopicSet::from_config(&KafkaConfig::default())
    }

    async fn setup() -> (Arc<InMemoryMetadataStore>, Arc<InMemoryBroker>, CallTrigger, Campaign) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let calls = Arc::new(InMemoryCallStore::new());
        let bus = Arc::new(InMemoryBroker::new());

        let now = Utc::now();
        let campaign = Campaign {
            id: CampaignId::generate(),
            name: "renewals".into(),
            description: String::new(),
            timezone: "UTC".into(),
            business_hours: Vec::new(),
            max_concurrent_calls: 4,
            retry_policy: RetryPolicy::default(),
            status: CampaignStatus::InProgress,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
        };
        CampaignStore::create(&*metadata, &campaign).await.unwrap();
        StatsStore::ensure(&*metadata, campaign.id).await.unwrap();
        TargetStore::bulk_insert(
            &*metadata,
            &[CampaignTarget {
                id: TargetId::generate(),
                campaign_id: campaign.id,
                phone_number: "+15550100".into(),
                payload: None,
                state: TargetState::Pending,
                scheduled_at: None,
                last_attempt_at: None,
                attempt_count: 0,
                created_at: now,
            }],
        )
        .await
        .unwrap();

        let trigger = CallTrigger::new(
            metadata.clone(),
            calls,
            bus.clone(),
            topics(),
            RetryPolicy::default(),
            10,
        );
        (metadata, bus, trigger, campaign)
    }

    #[tokio::test]
    async fn external_trigger_requires_registered_target() {
        let (_, _, trigger, campaign) = setup().await;

        let err = trigger
            .trigger_call(TriggerCallInput {
                campaign_id: campaign.id,
                phone_number: "+19990000".into(),
                metadata: None,
                origin: TriggerOrigin::External,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn registered_target_dispatches_and_counts() {
        let (metadata, bus, trigger, campaign) = setup().await;

        let call = trigger
            .trigger_call(TriggerCallInput {
                campaign_id: campaign.id,
                phone_number: "+15550100".into(),
                metadata: None,
                origin: TriggerOrigin::External,
            })
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Queued);

        let stats = StatsStore::get(&*metadata, campaign.id).await.unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.pending_calls, 1);
        assert_eq!(bus.depth("dispatch").unwrap(), 1);
    }

    #[tokio::test]
    async fn scheduler_origin_skips_membership_scan() {
        let (_, bus, trigger, campaign) = setup().await;

        // Not a registered number, but scheduler-originated triggers carry
        // the claimed target as proof.
        trigger
            .trigger_call(TriggerCallInput {
                campaign_id: campaign.id,
                phone_number: "+17770000".into(),
                metadata: None,
                origin: TriggerOrigin::Scheduler,
            })
            .await
            .unwrap();
        assert_eq!(bus.depth("dispatch").unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_phone_is_rejected_before_any_write() {
        let (metadata, bus, trigger, campaign) = setup().await;

        let err = trigger
            .trigger_call(TriggerCallInput {
                campaign_id: campaign.id,
                phone_number: String::new(),
                metadata: None,
                origin: TriggerOrigin::External,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let stats = StatsStore::get(&*metadata, campaign.id).await.unwrap();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(bus.depth("dispatch").unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let (_, _, trigger, _) = setup().await;

        let err = trigger
            .trigger_call(TriggerCallInput {
                campaign_id: CampaignId::generate(),
                phone_number: "+15550100".into(),
                metadata: None,
                origin: TriggerOrigin::External,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
