//! Call execution model: per-call records and append-only attempt history.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{AttemptId, CallId, CampaignId};

/// Lifecycle stages of an individual outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Created but not yet enqueued.
    Pending,
    /// A dispatch message exists for the call.
    Queued,
    /// The telephony provider is executing the call.
    Dialing,
    /// Terminal success.
    Completed,
    /// Failed; terminal unless a retry is scheduled.
    Failed,
    /// Waiting in a retry tier for its next attempt.
    Retrying,
}

impl CallStatus {
    /// Returns the wire/storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Dialing => "dialing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Parses the wire/storage representation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown values.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "dialing" => Ok(Self::Dialing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(Error::validation(format!("unknown call status '{other}'"))),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An individual outbound call within a campaign.
///
/// `attempt_count` is monotonically non-decreasing; the status worker uses it
/// as the highest-applied-attempt marker to keep redeliveries idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    /// Unique identifier; also the message partition key.
    pub id: CallId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Destination phone number.
    pub phone_number: String,
    /// Current status.
    pub status: CallStatus,
    /// Highest attempt number reflected in this row.
    pub attempt_count: u32,
    /// Timestamp of the most recent attempt outcome.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the call was scheduled for dispatch.
    pub scheduled_at: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Error text from the most recent failed attempt.
    pub last_error: Option<String>,
}

/// One recorded call attempt. Append-only; never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAttempt {
    /// Unique identifier.
    pub id: AttemptId,
    /// The call this attempt belongs to.
    pub call_id: CallId,
    /// 1-based attempt number, unique per call.
    pub attempt_num: u32,
    /// Outcome status.
    pub status: CallStatus,
    /// Error text, empty on success.
    pub error: Option<String>,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
    /// When the outcome occurred.
    pub created_at: DateTime<Utc>,
}
