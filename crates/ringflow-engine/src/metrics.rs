//! Observability metrics for the dispatch engine.
//!
//! Exported through the `metrics` crate facade; install a recorder (e.g.
//! `metrics-exporter-prometheus`) in the binary to expose them.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `ringflow_dispatches_total` | Counter | `result` | Dispatch publishes by outcome |
//! | `ringflow_attempts_total` | Counter | `status` | Attempt outcomes seen by the status worker |
//! | `ringflow_retries_total` | Counter | `tier` | Retry envelopes routed per tier |
//! | `ringflow_deadletters_total` | Counter | - | Envelopes parked past exhaustion |
//! | `ringflow_scheduler_tick_duration_seconds` | Histogram | - | Tick processing time |
//! | `ringflow_scheduler_claimed_total` | Counter | - | Targets claimed by the scheduler |
//! | `ringflow_slot_wait_seconds` | Histogram | - | Time spent waiting for a campaign slot |
//! | `ringflow_call_duration_seconds` | Histogram | `status` | Provider call durations |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: dispatch publishes by outcome.
    pub const DISPATCHES_TOTAL: &str = "ringflow_dispatches_total";
    /// Counter: attempt outcomes processed by the status worker.
    pub const ATTEMPTS_TOTAL: &str = "ringflow_attempts_total";
    /// Counter: retry envelopes routed per tier.
    pub const RETRIES_TOTAL: &str = "ringflow_retries_total";
    /// Counter: envelopes routed to deadletter.
    pub const DEADLETTERS_TOTAL: &str = "ringflow_deadletters_total";
    /// Histogram: scheduler tick processing time in seconds.
    pub const SCHEDULER_TICK_DURATION_SECONDS: &str =
        "ringflow_scheduler_tick_duration_seconds";
    /// Counter: targets claimed by the scheduler.
    pub const SCHEDULER_CLAIMED_TOTAL: &str = "ringflow_scheduler_claimed_total";
    /// Histogram: slot acquisition wait in seconds.
    pub const SLOT_WAIT_SECONDS: &str = "ringflow_slot_wait_seconds";
    /// Histogram: provider call duration in seconds.
    pub const CALL_DURATION_SECONDS: &str = "ringflow_call_duration_seconds";
    /// Gauge: approximate pending depth per topic.
    pub const QUEUE_DEPTH: &str = "ringflow_queue_depth";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of an operation (published, failed, deduplicated).
    pub const RESULT: &str = "result";
    /// Call status (completed, failed, retrying).
    pub const STATUS: &str = "status";
    /// Retry tier index.
    pub const TIER: &str = "tier";
    /// Topic name for depth gauges.
    pub const TOPIC: &str = "topic";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across workers.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a dispatch publish outcome.
    pub fn record_dispatch(&self, result: &str) {
        counter!(
            names::DISPATCHES_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records one attempt outcome processed by the status worker.
    pub fn record_attempt(&self, status: &str) {
        counter!(
            names::ATTEMPTS_TOTAL,
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records a retry routed to the given 1-based tier.
    pub fn record_retry(&self, tier: usize) {
        counter!(
            names::RETRIES_TOTAL,
            labels::TIER => tier.to_string(),
        )
        .increment(1);
    }

    /// Records an envelope routed to deadletter.
    pub fn record_deadletter(&self) {
        counter!(names::DEADLETTERS_TOTAL).increment(1);
    }

    /// Records scheduler tick duration.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Records how many targets one tick claimed.
    pub fn record_claimed(&self, count: usize) {
        counter!(names::SCHEDULER_CLAIMED_TOTAL).increment(count as u64);
    }

    /// Records time spent waiting for a campaign slot.
    pub fn observe_slot_wait(&self, duration: Duration) {
        histogram!(names::SLOT_WAIT_SECONDS).record(duration.as_secs_f64());
    }

    /// Records a provider call duration with its outcome status.
    pub fn observe_call_duration(&self, status: &str, duration: Duration) {
        histogram!(
            names::CALL_DURATION_SECONDS,
            labels::STATUS => status.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Updates the approximate pending depth for a topic.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, topic: &str, depth: usize) {
        gauge!(
            names::QUEUE_DEPTH,
            labels::TOPIC => topic.to_string(),
        )
        .set(depth as f64);
    }
}

/// RAII guard for timing operations; records on drop.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records into the tick-duration histogram.
#[must_use]
pub fn time_scheduler_tick() -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(|duration| {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    })
}
