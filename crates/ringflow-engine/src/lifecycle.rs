//! Campaign lifecycle service.
//!
//! The administrative surface is out of scope for this crate, but it is a
//! thin shell over the operations here: create with validation, start,
//! pause, complete, and delete, all enforcing the campaign state machine.
//! Natural completion (all targets terminal) is deliberately *not* detected
//! by the engine; `complete` is an operator action.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;

use ringflow_core::{
    BusinessHourWindow, Campaign, CampaignId, CampaignStatus, CampaignTarget, RetryPolicy,
    TargetId, TargetState,
};

use crate::error::{Error, Result};
use crate::store::{CampaignStore, StatsStore, TargetStore};

/// One target in a campaign creation request.
#[derive(Debug, Clone)]
pub struct TargetInput {
    /// Destination phone number.
    pub phone_number: String,
    /// Opaque payload carried through to dispatch metadata.
    pub payload: Option<HashMap<String, serde_json::Value>>,
}

/// Arguments for creating a campaign.
#[derive(Debug, Clone)]
pub struct CreateCampaignInput {
    /// Unique, case-insensitive name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// IANA timezone for the calling windows.
    pub timezone: String,
    /// Concurrency ceiling; <= 0 falls back to the configured default.
    pub max_concurrent_calls: i32,
    /// Retry policy; `None` uses the configured default.
    pub retry_policy: Option<RetryPolicy>,
    /// Allowed calling windows; empty means 24x7.
    pub business_hours: Vec<BusinessHourWindow>,
    /// Targets registered with the campaign.
    pub targets: Vec<TargetInput>,
}

/// Campaign lifecycle operations over the metadata store.
pub struct CampaignLifecycle {
    campaigns: Arc<dyn CampaignStore>,
    targets: Arc<dyn TargetStore>,
    stats: Arc<dyn StatsStore>,
    default_retry: RetryPolicy,
    default_concurrency: i32,
}

impl CampaignLifecycle {
    /// Builds the lifecycle service over a metadata store.
    pub fn new<M>(metadata: Arc<M>, default_retry: RetryPolicy, default_concurrency: i32) -> Self
    where
        M: CampaignStore + TargetStore + StatsStore + 'static,
    {
        Self {
            campaigns: metadata.clone(),
            targets: metadata.clone(),
            stats: metadata,
            default_retry,
            default_concurrency,
        }
    }

    /// Provisions a new campaign in `pending` with its windows, counter row,
    /// and registered targets.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty name, malformed windows, or a bad policy
    /// - `Conflict` when the name is taken (case-insensitive)
    pub async fn create(&self, input: CreateCampaignInput) -> Result<Campaign> {
        if input.name.trim().is_empty() {
            return Err(Error::validation("campaign name is required"));
        }
        for window in &input.business_hours {
            window.validate()?;
        }
        // Invalid timezones are accepted but surfaced: the scheduler treats
        // them as 24x7 rather than freezing the campaign.
        if input.timezone.parse::<Tz>().is_err() {
            tracing::warn!(
                timezone = %input.timezone,
                name = %input.name,
                "campaign timezone is not a valid IANA name; windows will not gate dialing"
            );
        }

        let retry_policy = match input.retry_policy {
            Some(policy) => {
                policy.validate()?;
                policy
            }
            None => self.default_retry.clone(),
        };
        let max_concurrent = if input.max_concurrent_calls > 0 {
            input.max_concurrent_calls
        } else {
            self.default_concurrency
        };

        let now = Utc::now();
        let campaign = Campaign {
            id: CampaignId::generate(),
            name: input.name,
            description: input.description,
            timezone: input.timezone,
            business_hours: input.business_hours,
            max_concurrent_calls: max_concurrent,
            retry_policy,
            status: CampaignStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.campaigns.create(&campaign).await?;
        self.stats.ensure(campaign.id).await?;

        if !input.targets.is_empty() {
            let records: Vec<CampaignTarget> = input
                .targets
                .into_iter()
                .map(|t| CampaignTarget {
                    id: TargetId::generate(),
                    campaign_id: campaign.id,
                    phone_number: t.phone_number,
                    payload: t.payload,
                    state: TargetState::Pending,
                    scheduled_at: None,
                    last_attempt_at: None,
                    attempt_count: 0,
                    created_at: now,
                })
                .collect();
            self.targets.bulk_insert(&records).await?;
        }

        Ok(campaign)
    }

    /// Fetches a campaign with its windows.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown campaigns.
    pub async fn get(&self, id: CampaignId) -> Result<Campaign> {
        self.campaigns.get(id).await
    }

    /// Registers additional targets on an existing campaign.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown campaigns.
    pub async fn add_targets(&self, id: CampaignId, targets: Vec<TargetInput>) -> Result<usize> {
        let campaign = self.campaigns.get(id).await?;
        let now = Utc::now();
        let records: Vec<CampaignTarget> = targets
            .into_iter()
            .map(|t| CampaignTarget {
                id: TargetId::generate(),
                campaign_id: campaign.id,
                phone_number: t.phone_number,
                payload: t.payload,
                state: TargetState::Pending,
                scheduled_at: None,
                last_attempt_at: None,
                attempt_count: 0,
                created_at: now,
            })
            .collect();
        let count = records.len();
        self.targets.bulk_insert(&records).await?;
        Ok(count)
    }

    /// Starts dialing: `pending | paused -> in_progress`. Idempotent when
    /// already in progress.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the campaign is completed or failed.
    pub async fn start(&self, id: CampaignId) -> Result<Campaign> {
        self.transition(id, CampaignStatus::InProgress).await
    }

    /// Pauses dialing.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for disallowed transitions.
    pub async fn pause(&self, id: CampaignId) -> Result<Campaign> {
        self.transition(id, CampaignStatus::Paused).await
    }

    /// Completes the campaign; terminal.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` for disallowed transitions.
    pub async fn complete(&self, id: CampaignId) -> Result<Campaign> {
        self.transition(id, CampaignStatus::Completed).await
    }

    /// Deletes a campaign along with its targets and counters.
    pub async fn delete(&self, id: CampaignId) -> Result<()> {
        self.campaigns.delete(id).await
    }

    async fn transition(&self, id: CampaignId, next: CampaignStatus) -> Result<Campaign> {
        let mut campaign = self.campaigns.get(id).await?;
        campaign
            .transition(next, Utc::now())
            .map_err(|e| Error::conflict(e.to_string()))?;
        self.campaigns.update(&campaign).await?;
        Ok(campaign)
    }
}
