//! Campaign domain model: campaigns, calling windows, targets, and counters.
//!
//! Lifecycle rules live here so every component enforces the same state
//! machines:
//!
//! - Campaigns: `pending -> in_progress -> {paused, completed}`, with
//!   `paused -> in_progress` allowed and `completed` terminal.
//! - Targets: `pending -> queued -> in_flight -> {done, failed}`, plus the
//!   scheduler revert edge `queued -> pending` used when a dispatch publish
//!   fails. Terminal states are never left.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{CampaignId, TargetId};

/// Lifecycle states of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Created but not yet started.
    Pending,
    /// Actively dialing while inside an allowed window.
    InProgress,
    /// Temporarily halted by an operator.
    Paused,
    /// Finished; terminal.
    Completed,
    /// Aborted after an unrecoverable failure; terminal.
    Failed,
}

impl CampaignStatus {
    /// Returns the wire/storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true if no further transitions are allowed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Checks whether a transition to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Paused, Self::InProgress)
                | (Self::InProgress, Self::Paused | Self::Completed | Self::Failed)
                | (Self::Paused, Self::Completed | Self::Failed)
        )
    }

    /// Parses the storage representation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!(
                "unknown campaign status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry rules applied to failed call attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (>= 1).
    pub max_attempts: u32,
    /// Base delay for the first retry (> 0).
    pub base_delay: Duration,
    /// Upper bound on any computed delay (>= `base_delay`).
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`; 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Validates the policy bounds.
    ///
    /// # Errors
    ///
    /// Returns a validation error when any bound is violated.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::validation("retry max_attempts must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(Error::validation("retry base_delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::validation(
                "retry max_delay must be at least base_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::validation("retry jitter must be within [0, 1]"));
        }
        Ok(())
    }
}

/// An allowed dialing interval for one day of the week, in campaign-local
/// minutes.
///
/// `day_of_week` follows the storage convention `0 = Sunday .. 6 = Saturday`.
/// When `end_minute <= start_minute` the window spans midnight into the next
/// calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHourWindow {
    /// Day of week, `0 = Sunday .. 6 = Saturday`.
    pub day_of_week: u8,
    /// Start minute of day, `0..=1439`.
    pub start_minute: u16,
    /// End minute of day (exclusive), `0..=1439`.
    pub end_minute: u16,
}

impl BusinessHourWindow {
    /// Validates field ranges.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.day_of_week > 6 {
            return Err(Error::validation("day_of_week must be within 0..=6"));
        }
        if self.start_minute > 1439 || self.end_minute > 1439 {
            return Err(Error::validation("window minutes must be within 0..=1439"));
        }
        Ok(())
    }

    /// Returns true when the window crosses midnight into the next day.
    #[must_use]
    pub const fn spans_midnight(&self) -> bool {
        self.end_minute <= self.start_minute
    }

    /// Checks whether a local `(weekday, minute-of-day)` falls inside this
    /// window.
    ///
    /// `weekday` uses the same `0 = Sunday` convention as `day_of_week`.
    #[must_use]
    pub fn contains(&self, weekday: u8, minute: u16) -> bool {
        if self.spans_midnight() {
            // Late segment on the window's own day, early segment the day after.
            (self.day_of_week == weekday && minute >= self.start_minute)
                || ((self.day_of_week + 1) % 7 == weekday && minute < self.end_minute)
        } else {
            self.day_of_week == weekday && minute >= self.start_minute && minute < self.end_minute
        }
    }
}

/// An outbound call campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Unique identifier.
    pub id: CampaignId,
    /// Unique, case-insensitive name.
    pub name: String,
    /// Free-form operator description.
    pub description: String,
    /// IANA timezone name the calling windows are evaluated in.
    pub timezone: String,
    /// Per-day allowed calling windows; empty means 24x7.
    pub business_hours: Vec<BusinessHourWindow>,
    /// Per-campaign concurrency ceiling; values <= 0 fall back to the
    /// configured default.
    pub max_concurrent_calls: i32,
    /// Retry rules for failed attempts.
    pub retry_policy: RetryPolicy,
    /// Current lifecycle state.
    pub status: CampaignStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the campaign first enters `in_progress`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the campaign completes.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Transitions the campaign to `next`, stamping lifecycle timestamps.
    ///
    /// Transitioning to the current status is a no-op (idempotent start).
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` when the edge is not allowed,
    /// including any transition out of a terminal state.
    pub fn transition(&mut self, next: CampaignStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            let reason = if self.status.is_terminal() {
                "campaign is terminal"
            } else {
                "transition not allowed"
            };
            return Err(Error::invalid_transition(
                self.status.as_str(),
                next.as_str(),
                reason,
            ));
        }

        self.status = next;
        self.updated_at = now;
        match next {
            CampaignStatus::InProgress if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            CampaignStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }
}

/// Lifecycle states of a campaign target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Registered, waiting to be claimed by a scheduler tick.
    Pending,
    /// Claimed by the scheduler; a dispatch message exists (or is imminent).
    Queued,
    /// A call attempt is executing.
    InFlight,
    /// Terminal success.
    Done,
    /// Terminal failure after attempt exhaustion.
    Failed,
}

impl TargetState {
    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `done` and `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Checks whether a transition to `next` is allowed.
    ///
    /// The `queued -> pending` edge is the scheduler's publish-failure
    /// revert; terminal states have no outgoing edges.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Queued)
                | (Self::Queued, Self::InFlight | Self::Pending)
                | (Self::InFlight, Self::Done | Self::Failed)
        )
    }

    /// Parses the storage representation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "in_flight" => Ok(Self::InFlight),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(format!("unknown target state '{other}'"))),
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A phone number registered to a campaign; the scheduler's unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTarget {
    /// Unique identifier.
    pub id: TargetId,
    /// Owning campaign; targets are deleted with it.
    pub campaign_id: CampaignId,
    /// Destination phone number.
    pub phone_number: String,
    /// Opaque per-target payload, carried through dispatch metadata unchanged.
    pub payload: Option<HashMap<String, serde_json::Value>>,
    /// Current lifecycle state.
    pub state: TargetState,
    /// Set when the scheduler claims the target.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent attempt outcome.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Number of attempts executed so far.
    pub attempt_count: u32,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

/// Aggregate per-campaign counters.
///
/// At quiescence `total = completed + failed + in_progress + pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    /// Calls created.
    pub total_calls: i64,
    /// Calls that reached `completed`.
    pub completed_calls: i64,
    /// Calls that failed terminally.
    pub failed_calls: i64,
    /// Calls currently executing.
    pub in_progress_calls: i64,
    /// Calls created but not yet terminal.
    pub pending_calls: i64,
    /// Retry attempts scheduled.
    pub retries_scheduled: i64,
}

impl CampaignStats {
    /// Applies an additive delta.
    pub fn apply(&mut self, delta: StatsDelta) {
        self.total_calls += delta.total_calls;
        self.completed_calls += delta.completed_calls;
        self.failed_calls += delta.failed_calls;
        self.in_progress_calls += delta.in_progress_calls;
        self.pending_calls += delta.pending_calls;
        self.retries_scheduled += delta.retries_scheduled;
    }
}

/// Atomic counter increments applied to [`CampaignStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    /// Delta for calls created.
    pub total_calls: i64,
    /// Delta for completed calls.
    pub completed_calls: i64,
    /// Delta for terminally failed calls.
    pub failed_calls: i64,
    /// Delta for currently executing calls.
    pub in_progress_calls: i64,
    /// Delta for non-terminal calls.
    pub pending_calls: i64,
    /// Delta for scheduled retries.
    pub retries_scheduled: i64,
}

impl StatsDelta {
    /// Delta for a freshly created call: `{total + 1, pending + 1}`.
    #[must_use]
    pub const fn dispatched() -> Self {
        Self {
            total_calls: 1,
            pending_calls: 1,
            completed_calls: 0,
            failed_calls: 0,
            in_progress_calls: 0,
            retries_scheduled: 0,
        }
    }

    /// Returns true when every field is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_calls == 0
            && self.completed_calls == 0
            && self.failed_calls == 0
            && self.in_progress_calls == 0
            && self.pending_calls == 0
            && self.retries_scheduled == 0
    }
}
