//! Call worker: executes dispatch messages against the telephony provider
//! under the per-campaign concurrency semaphore.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backoff::compute_next_attempt;
use crate::bus::{BusConsumer, Message, MessageBus, RetryRouter, StatusPublisher};
use crate::error::{Error, Result};
use crate::messages::{DispatchMessage, StatusMessage};
use crate::metrics::EngineMetrics;
use crate::telephony::{CallOutcome, Provider};
use crate::throttle::SlotLimiter;
use crate::topics::TopicSet;

/// Pause between slot-acquisition attempts when the campaign is saturated.
const SLOT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Executes dispatch messages and publishes their outcomes.
pub struct CallWorker {
    bus: Arc<dyn MessageBus>,
    topics: TopicSet,
    limiter: Arc<dyn SlotLimiter>,
    provider: Arc<dyn Provider>,
    status: StatusPublisher,
    router: RetryRouter,
    default_limit: i32,
    request_timeout: Duration,
    metrics: EngineMetrics,
    rng: Mutex<StdRng>,
}

impl CallWorker {
    /// Builds a call worker.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topics: TopicSet,
        limiter: Arc<dyn SlotLimiter>,
        provider: Arc<dyn Provider>,
        default_limit: i32,
        request_timeout: Duration,
    ) -> Self {
        let status = StatusPublisher::new(bus.clone(), topics.status.clone());
        let router = RetryRouter::new(bus.clone(), topics.clone());
        Self {
            bus,
            topics,
            limiter,
            provider,
            status,
            router,
            default_limit,
            request_timeout: if request_timeout.is_zero() {
                Duration::from_secs(10)
            } else {
                request_timeout
            },
            metrics: EngineMetrics::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeds the jitter RNG, making retry delays deterministic in tests.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Consumes the dispatch topic until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error only when the consumer cannot be created.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let consumer = self
            .bus
            .consumer(&self.topics.dispatch, &self.topics.consumer_group)
            .await?;

        loop {
            let msg = match consumer.fetch(&cancel).await {
                Ok(msg) => msg,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "call worker fetch failed");
                    continue;
                }
            };

            match self.process(&*consumer, &msg, &cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => tracing::error!(error = %e, "call worker failed to process message"),
            }
        }
    }

    async fn process(
        &self,
        consumer: &dyn BusConsumer,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dispatch: DispatchMessage = match msg.decode() {
            Ok(dispatch) => dispatch,
            Err(e) => {
                // Poison message: park it for inspection and move on.
                tracing::error!(error = %e, "undecodable dispatch message");
                if let Err(dead_err) = self.router.dead_letter(&msg.key, &msg.payload).await {
                    tracing::error!(error = %dead_err, "failed to deadletter poison dispatch");
                }
                return consumer.commit(msg).await;
            }
        };

        let span = ringflow_core::observability::worker_span(
            "call.dispatch",
            &dispatch.campaign_id.to_string(),
            &dispatch.call_id.to_string(),
            dispatch.attempt,
        );

        async {
            let limit = if dispatch.concurrency_limit > 0 {
                dispatch.concurrency_limit
            } else {
                self.default_limit
            };

            let slot_held = self.wait_for_slot(&dispatch, limit, cancel).await?;

            let outcome = self.place_call(&dispatch).await;
            self.metrics
                .observe_call_duration(outcome.status.as_str(), outcome.duration);

            let status_msg = self.build_status(&dispatch, outcome);

            let publish_result = self.status.publish(&status_msg).await;

            // Release is unconditional on every exit path; the TTL only
            // backstops crashes.
            if slot_held {
                if let Err(e) = self.limiter.release(dispatch.campaign_id).await {
                    tracing::warn!(error = %e, "failed to release campaign slot");
                }
            }

            // An unpublished outcome means the attempt is not yet reflected
            // anywhere; leave the offset uncommitted so it redelivers.
            publish_result?;

            consumer.commit(msg).await
        }
        .instrument(span)
        .await
    }

    /// Loops until a slot is granted, the limiter says throttling is off,
    /// or cancellation. Acquisition errors are retried at the same cadence
    /// as saturation, surfacing pressure rather than dropping work.
    async fn wait_for_slot(
        &self,
        dispatch: &DispatchMessage,
        limit: i32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if limit <= 0 {
            return Ok(false);
        }

        let wait_timer = crate::metrics::TimingGuard::new(|d| {
            EngineMetrics::new().observe_slot_wait(d);
        });
        loop {
            match self.limiter.try_acquire(dispatch.campaign_id, limit).await {
                Ok(true) => {
                    drop(wait_timer);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "slot acquisition failed, retrying");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(SLOT_RETRY_INTERVAL) => {}
            }
        }
    }

    /// Invokes the provider under the request timeout, mapping transport
    /// failures and timeouts to failed outcomes whose retryability mirrors
    /// the policy rather than the provider.
    async fn place_call(&self, dispatch: &DispatchMessage) -> CallOutcome {
        let attempts_left = dispatch.attempt < dispatch.max_attempts;
        match tokio::time::timeout(self.request_timeout, self.provider.place_call(dispatch)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "telephony transport failure");
                CallOutcome::failed(Duration::ZERO, attempts_left, e.to_string())
            }
            Err(_) => {
                tracing::error!(timeout = ?self.request_timeout, "telephony request timed out");
                CallOutcome::failed(self.request_timeout, attempts_left, "request timed out")
            }
        }
    }

    fn build_status(&self, dispatch: &DispatchMessage, outcome: CallOutcome) -> StatusMessage {
        let retryable = outcome.retryable && dispatch.attempt < dispatch.max_attempts;
        let duration_ms = i64::try_from(outcome.duration.as_millis()).unwrap_or(i64::MAX);

        let next_attempt = if retryable {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Some(compute_next_attempt(dispatch, Utc::now(), &mut *rng))
        } else {
            None
        };

        StatusMessage {
            call_id: dispatch.call_id,
            campaign_id: dispatch.campaign_id,
            phone_number: dispatch.phone_number.clone(),
            status: outcome.status,
            attempt: dispatch.attempt,
            max_attempts: dispatch.max_attempts,
            retryable,
            retry_base_ms: dispatch.retry_base_ms,
            retry_max_ms: dispatch.retry_max_ms,
            retry_jitter: dispatch.retry_jitter,
            concurrency_limit: dispatch.concurrency_limit,
            duration_ms,
            error: outcome.error,
            occurred_at: Utc::now(),
            next_attempt,
            metadata: dispatch.metadata.clone(),
        }
    }
}
