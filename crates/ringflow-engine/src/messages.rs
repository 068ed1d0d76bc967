//! Message envelopes routed through the message log.
//!
//! The message set is a closed sum: [`DispatchMessage`] instructs a call
//! worker to place a call, [`StatusMessage`] carries the outcome of one
//! attempt, and [`RetryMessage`] parks a dispatch in a delay tier until its
//! `next_attempt` time.
//!
//! Envelopes are JSON with stable snake_case field names; `call_id` and
//! `campaign_id` serialize as canonical UUID strings and timestamps as
//! RFC 3339 UTC. The 16 raw bytes of the call ID are the partition key on
//! every topic, so all messages for one call converge on one partition and
//! keep their relative order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ringflow_core::{Call, CallId, CallStatus, CampaignId, RetryPolicy};

/// Instruction to initiate one call attempt.
///
/// Carries the full retry policy and concurrency limit so workers never need
/// a metadata-store round trip on the hot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// The call to execute.
    pub call_id: CallId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Destination phone number.
    pub phone_number: String,
    /// 1-based attempt number this dispatch represents.
    pub attempt: u32,
    /// Maximum attempts allowed, including the first.
    pub max_attempts: u32,
    /// Retry base delay in milliseconds.
    pub retry_base_ms: i64,
    /// Retry delay cap in milliseconds.
    pub retry_max_ms: i64,
    /// Retry jitter fraction in `[0, 1]`.
    pub retry_jitter: f64,
    /// Per-campaign concurrency ceiling; <= 0 means the configured default.
    pub concurrency_limit: i32,
    /// Opaque caller metadata, carried through unchanged.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// When this dispatch entered the log.
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchMessage {
    /// Builds the first-attempt dispatch for a freshly created call.
    #[must_use]
    pub fn first_attempt(
        call: &Call,
        policy: &RetryPolicy,
        concurrency_limit: i32,
        metadata: Option<HashMap<String, serde_json::Value>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            call_id: call.id,
            campaign_id: call.campaign_id,
            phone_number: call.phone_number.clone(),
            attempt: 1,
            max_attempts: policy.max_attempts,
            retry_base_ms: i64::try_from(policy.base_delay.as_millis()).unwrap_or(i64::MAX),
            retry_max_ms: i64::try_from(policy.max_delay.as_millis()).unwrap_or(i64::MAX),
            retry_jitter: policy.jitter,
            concurrency_limit,
            metadata,
            enqueued_at: now,
        }
    }

    /// Returns the partition key: the 16 raw bytes of the call ID.
    #[must_use]
    pub const fn partition_key(&self) -> &[u8; 16] {
        self.call_id.as_bytes()
    }

    /// Returns the idempotency key distinguishing retried attempts.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.call_id, self.attempt)
    }

    /// Returns true when this dispatch is already at the final allowed
    /// attempt.
    #[must_use]
    pub const fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Outcome of one call attempt, published by the call worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// The call the attempt belongs to.
    pub call_id: CallId,
    /// Owning campaign.
    pub campaign_id: CampaignId,
    /// Destination phone number.
    pub phone_number: String,
    /// Outcome status.
    pub status: CallStatus,
    /// 1-based attempt number that produced this outcome.
    pub attempt: u32,
    /// Maximum attempts allowed, mirrored from the dispatch.
    pub max_attempts: u32,
    /// True when a further attempt should be scheduled.
    pub retryable: bool,
    /// Retry base delay in milliseconds, mirrored from the dispatch.
    pub retry_base_ms: i64,
    /// Retry delay cap in milliseconds, mirrored from the dispatch.
    pub retry_max_ms: i64,
    /// Retry jitter fraction, mirrored from the dispatch.
    pub retry_jitter: f64,
    /// Concurrency ceiling, mirrored from the dispatch.
    pub concurrency_limit: i32,
    /// Attempt duration in milliseconds.
    pub duration_ms: i64,
    /// Error text, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the outcome occurred.
    pub occurred_at: DateTime<Utc>,
    /// Scheduled time of the next attempt, present when retryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
    /// Opaque caller metadata, carried through unchanged.
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl StatusMessage {
    /// Returns the partition key: the 16 raw bytes of the call ID.
    #[must_use]
    pub const fn partition_key(&self) -> &[u8; 16] {
        self.call_id.as_bytes()
    }

    /// Builds the retry envelope for the next attempt, when one is due.
    ///
    /// Returns `None` unless the outcome is retryable and carries a
    /// `next_attempt` time. The embedded dispatch advances `attempt` by one
    /// and is stamped with the scheduled time.
    #[must_use]
    pub fn to_retry(&self) -> Option<RetryMessage> {
        let next_attempt = self.next_attempt?;
        if !self.retryable {
            return None;
        }
        Some(RetryMessage {
            dispatch: DispatchMessage {
                call_id: self.call_id,
                campaign_id: self.campaign_id,
                phone_number: self.phone_number.clone(),
                attempt: self.attempt + 1,
                max_attempts: self.max_attempts,
                retry_base_ms: self.retry_base_ms,
                retry_max_ms: self.retry_max_ms,
                retry_jitter: self.retry_jitter,
                concurrency_limit: self.concurrency_limit,
                metadata: self.metadata.clone(),
                enqueued_at: next_attempt,
            },
            next_attempt,
        })
    }
}

/// A dispatch parked in a retry tier until `next_attempt`.
///
/// The embedded dispatch is republished verbatim (with a fresh
/// `enqueued_at`) once the delay elapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMessage {
    /// The dispatch to republish after the delay.
    #[serde(flatten)]
    pub dispatch: DispatchMessage,
    /// Earliest time the embedded dispatch may be republished.
    pub next_attempt: DateTime<Utc>,
}

impl RetryMessage {
    /// Returns the partition key: the 16 raw bytes of the call ID.
    #[must_use]
    pub const fn partition_key(&self) -> &[u8; 16] {
        self.dispatch.call_id.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringflow_core::RetryPolicy;

    fn sample_dispatch() -> DispatchMessage {
        DispatchMessage {
            call_id: CallId::generate(),
            campaign_id: CampaignId::generate(),
            phone_number: "+15550100".into(),
            attempt: 1,
            max_attempts: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
            retry_jitter: 0.0,
            concurrency_limit: 5,
            metadata: None,
            enqueued_at: Utc::now(),
        }
    }

    fn sample_status(retryable: bool, next: Option<DateTime<Utc>>) -> StatusMessage {
        let dispatch = sample_dispatch();
        StatusMessage {
            call_id: dispatch.call_id,
            campaign_id: dispatch.campaign_id,
            phone_number: dispatch.phone_number,
            status: CallStatus::Failed,
            attempt: 1,
            max_attempts: 3,
            retryable,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
            retry_jitter: 0.0,
            concurrency_limit: 5,
            duration_ms: 1_250,
            error: Some("busy".into()),
            occurred_at: Utc::now(),
            next_attempt: next,
            metadata: None,
        }
    }

    #[test]
    fn dispatch_json_field_names_are_stable() {
        let msg = sample_dispatch();
        let value = serde_json::to_value(&msg).unwrap();
        for field in [
            "call_id",
            "campaign_id",
            "phone_number",
            "attempt",
            "max_attempts",
            "retry_base_ms",
            "retry_max_ms",
            "retry_jitter",
            "concurrency_limit",
            "enqueued_at",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(value["call_id"], msg.call_id.to_string());
    }

    #[test]
    fn dispatch_roundtrips() {
        let msg = sample_dispatch();
        let json = serde_json::to_string(&msg).unwrap();
        let back: DispatchMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn first_attempt_mirrors_policy() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let call = Call {
            id: CallId::generate(),
            campaign_id: CampaignId::generate(),
            phone_number: "+15550100".into(),
            status: CallStatus::Queued,
            attempt_count: 0,
            last_attempt_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        let msg = DispatchMessage::first_attempt(&call, &policy, 8, None, now);
        assert_eq!(msg.attempt, 1);
        assert_eq!(msg.max_attempts, policy.max_attempts);
        assert_eq!(msg.retry_base_ms, 2_000);
        assert_eq!(msg.retry_max_ms, 120_000);
        assert_eq!(msg.concurrency_limit, 8);
    }

    #[test]
    fn retry_message_flattens_dispatch_fields() {
        let status = sample_status(true, Some(Utc::now()));
        let retry = status.to_retry().unwrap();
        let value = serde_json::to_value(&retry).unwrap();
        // Embedded dispatch fields sit at the top level next to next_attempt.
        assert!(value.get("call_id").is_some());
        assert!(value.get("attempt").is_some());
        assert!(value.get("next_attempt").is_some());
        assert_eq!(value["attempt"], 2);
    }

    #[test]
    fn to_retry_requires_retryable_and_next() {
        assert!(sample_status(false, Some(Utc::now())).to_retry().is_none());
        assert!(sample_status(true, None).to_retry().is_none());

        let retry = sample_status(true, Some(Utc::now())).to_retry().unwrap();
        assert_eq!(retry.dispatch.attempt, 2);
        assert_eq!(retry.dispatch.enqueued_at, retry.next_attempt);
    }

    #[test]
    fn status_omits_absent_optionals() {
        let mut status = sample_status(false, None);
        status.error = None;
        let value = serde_json::to_value(&status).unwrap();
        assert!(value.get("error").is_none());
        assert!(value.get("next_attempt").is_none());
    }

    #[test]
    fn idempotency_key_distinguishes_attempts() {
        let mut msg = sample_dispatch();
        let first = msg.idempotency_key();
        msg.attempt = 2;
        assert_ne!(first, msg.idempotency_key());
    }
}
