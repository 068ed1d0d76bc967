//! Persistence seams for the metadata store and the attempt store.
//!
//! This module provides:
//!
//! - [`CampaignStore`]: Campaign rows and their calling windows
//! - [`TargetStore`]: Target lifecycle, including the atomic scheduler claim
//! - [`StatsStore`]: Per-campaign counters with atomic additive deltas
//! - [`CallStore`]: Per-call records and append-only attempt history
//!
//! In-memory implementations back the tests; the `postgres` feature provides
//! the production adapters. Repositories wrap driver errors with context but
//! preserve the error variant (`NotFound`, `Conflict`, `Storage`) so callers
//! can classify.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ringflow_core::{
    BusinessHourWindow, Call, CallAttempt, CallId, Campaign, CampaignId, CampaignStats,
    CampaignStatus, CampaignTarget, StatsDelta, TargetId, TargetState,
};

use crate::error::Result;

/// Campaign metadata persistence.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Inserts a new campaign with its calling windows.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when another campaign already uses the name
    /// (case-insensitive).
    async fn create(&self, campaign: &Campaign) -> Result<()>;

    /// Fetches a campaign with its calling windows populated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such campaign exists.
    async fn get(&self, id: CampaignId) -> Result<Campaign>;

    /// Persists campaign fields and lifecycle timestamps.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such campaign exists.
    async fn update(&self, campaign: &Campaign) -> Result<()>;

    /// Lists campaigns in a given status, windows populated, oldest first.
    async fn list_by_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> Result<Vec<Campaign>>;

    /// Replaces the campaign's calling windows.
    async fn replace_business_hours(
        &self,
        id: CampaignId,
        windows: &[BusinessHourWindow],
    ) -> Result<()>;

    /// Deletes a campaign along with its targets and counters.
    async fn delete(&self, id: CampaignId) -> Result<()>;
}

/// Campaign target persistence.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Inserts a batch of targets, ignoring duplicates by id.
    async fn bulk_insert(&self, targets: &[CampaignTarget]) -> Result<()>;

    /// Atomically claims up to `limit` pending targets, oldest first,
    /// transitioning them `pending -> queued` with `scheduled_at = now` in
    /// the same operation so competing schedulers cannot double-claim.
    async fn claim_batch(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignTarget>>;

    /// Sets the state of the given targets; used by the scheduler to revert
    /// `queued -> pending` when a dispatch publish fails.
    async fn set_state(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
        state: TargetState,
    ) -> Result<()>;

    /// Records an attempt outcome on the target owning `phone_number`:
    /// bumps the attempt count, stamps `last_attempt_at`, and moves the
    /// state to `terminal` when given, else to `in_flight`.
    ///
    /// Unknown phone numbers are ignored (the call may have been triggered
    /// manually after its target was deleted).
    async fn record_outcome(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        terminal: Option<TargetState>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Checks whether `phone_number` is registered to the campaign.
    async fn contains_phone(&self, campaign_id: CampaignId, phone_number: &str) -> Result<bool>;

    /// Lists targets, optionally filtered by state, oldest first.
    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        state: Option<TargetState>,
        limit: usize,
    ) -> Result<Vec<CampaignTarget>>;
}

/// Aggregate counter persistence.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Ensures a counter row exists for the campaign.
    async fn ensure(&self, campaign_id: CampaignId) -> Result<()>;

    /// Fetches the current counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no row exists.
    async fn get(&self, campaign_id: CampaignId) -> Result<CampaignStats>;

    /// Applies an additive delta as one atomic update.
    async fn apply_delta(&self, campaign_id: CampaignId, delta: StatsDelta) -> Result<()>;
}

/// Per-call record and attempt-history persistence (the attempt store).
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Inserts a freshly created call.
    async fn create_call(&self, call: &Call) -> Result<()>;

    /// Reflects an attempt outcome on the call row.
    ///
    /// Returns `true` when the outcome advanced the row, `false` when
    /// `attempt` is at or below the highest already-applied attempt — the
    /// redelivery guard the status worker keys its side effects on.
    /// `attempt_count` never decreases.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such call exists.
    async fn update_call_status(
        &self,
        call_id: CallId,
        status: ringflow_core::CallStatus,
        attempt: u32,
        error: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Fetches one call.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no such call exists.
    async fn get_call(&self, call_id: CallId) -> Result<Call>;

    /// Appends one attempt record, keyed by `(call_id, attempt_num)`.
    ///
    /// Re-appending an existing key is a no-op, which makes status-message
    /// redelivery safe.
    async fn append_attempt(&self, attempt: &CallAttempt) -> Result<()>;

    /// Lists a call's attempts in attempt order.
    async fn list_attempts(&self, call_id: CallId) -> Result<Vec<CallAttempt>>;

    /// Lists recent calls for a campaign.
    async fn list_calls_by_campaign(
        &self,
        campaign_id: CampaignId,
        limit: usize,
    ) -> Result<Vec<Call>>;
}
