//! Telephony provider interface.
//!
//! The provider is the only component that talks to the outside phone
//! network. It sits behind a narrow trait so workers can run against a mock
//! in tests and a real bridge in production without touching the pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ringflow_core::CallStatus;

use crate::error::Result;
use crate::messages::DispatchMessage;

/// Outcome of one telephony attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// Terminal status of the attempt: `completed` or `failed`.
    pub status: CallStatus,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
    /// Provider's opinion on whether a retry could succeed.
    pub retryable: bool,
    /// Error text when the attempt failed.
    pub error: Option<String>,
}

impl CallOutcome {
    /// A successful attempt of the given duration.
    #[must_use]
    pub const fn completed(duration: Duration) -> Self {
        Self {
            status: CallStatus::Completed,
            duration,
            retryable: false,
            error: None,
        }
    }

    /// A failed attempt with the provider's retry opinion.
    #[must_use]
    pub fn failed(duration: Duration, retryable: bool, error: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Failed,
            duration,
            retryable,
            error: Some(error.into()),
        }
    }
}

/// Abstraction over the external telephony bridge.
///
/// Implementations must honor cancellation at the transport level; the call
/// worker additionally enforces `call_bridge.request_timeout` around every
/// invocation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Places one call attempt described by the dispatch message.
    ///
    /// # Errors
    ///
    /// Returns a telephony error only for transport-level failures; an
    /// answered-but-failed call is an `Ok` outcome with `status = failed`.
    async fn place_call(&self, msg: &DispatchMessage) -> Result<CallOutcome>;

    /// Returns the provider's name, for logs and metrics.
    fn name(&self) -> &str;
}

/// Simulated provider with a configurable success rate.
///
/// Deterministic when seeded, which the pipeline tests rely on.
#[derive(Debug)]
pub struct MockProvider {
    success_rate: f64,
    retryable_rate: f64,
    rng: Mutex<StdRng>,
}

impl MockProvider {
    /// Creates a mock with an 80% success rate and 70% of failures
    /// retryable, seeded from entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Creates a deterministic mock from a seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            success_rate: 0.8,
            retryable_rate: 0.7,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Overrides the success rate.
    #[must_use]
    pub const fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate;
        self
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn place_call(&self, _msg: &DispatchMessage) -> Result<CallOutcome> {
        let (duration, roll, retry_roll) = {
            let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (
                Duration::from_millis(rng.gen_range(400..2_500)),
                rng.gen::<f64>(),
                rng.gen::<f64>(),
            )
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        if roll <= self.success_rate {
            Ok(CallOutcome::completed(duration))
        } else {
            let retryable = retry_roll < self.retryable_rate;
            Ok(CallOutcome::failed(duration, retryable, "simulated failure"))
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Provider that replays a fixed sequence of outcomes, for tests.
///
/// Once the script is exhausted every further call completes successfully.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<CallOutcome>>,
}

impl ScriptedProvider {
    /// Creates a provider replaying `outcomes` in order.
    #[must_use]
    pub fn new(outcomes: impl IntoIterator<Item = CallOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn place_call(&self, _msg: &DispatchMessage) -> Result<CallOutcome> {
        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        Ok(next.unwrap_or_else(|| CallOutcome::completed(Duration::from_millis(500))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ringflow_core::{CallId, CampaignId};

    fn dispatch() -> DispatchMessage {
        DispatchMessage {
            call_id: CallId::generate(),
            campaign_id: CampaignId::generate(),
            phone_number: "+15550100".into(),
            attempt: 1,
            max_attempts: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 10_000,
            retry_jitter: 0.0,
            concurrency_limit: 2,
            metadata: None,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn seeded_mock_is_deterministic() {
        let a = MockProvider::with_seed(42);
        let b = MockProvider::with_seed(42);
        for _ in 0..10 {
            let left = a.place_call(&dispatch()).await.unwrap();
            let right = b.place_call(&dispatch()).await.unwrap();
            assert_eq!(left, right);
        }
    }

    #[tokio::test]
    async fn always_succeeding_mock() {
        let provider = MockProvider::with_seed(1).with_success_rate(1.0);
        let outcome = provider.place_call(&dispatch()).await.unwrap();
        assert_eq!(outcome.status, CallStatus::Completed);
        assert!(!outcome.retryable);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn scripted_provider_replays_then_succeeds() {
        let provider = ScriptedProvider::new([
            CallOutcome::failed(Duration::from_millis(100), true, "busy"),
            CallOutcome::failed(Duration::from_millis(100), false, "rejected"),
        ]);

        let first = provider.place_call(&dispatch()).await.unwrap();
        assert!(first.retryable);

        let second = provider.place_call(&dispatch()).await.unwrap();
        assert_eq!(second.status, CallStatus::Failed);
        assert!(!second.retryable);

        let third = provider.place_call(&dispatch()).await.unwrap();
        assert_eq!(third.status, CallStatus::Completed);
    }
}
