//! Observability infrastructure for Ringflow.
//!
//! Structured logging with consistent spans across all services. This module
//! provides the initialization helper called from each binary and span
//! constructors used by the scheduler and workers.
//!
//! Phone numbers never appear in span fields; correlation happens through
//! campaign and call IDs.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `ringflow_engine=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one scheduler pass over a campaign.
#[must_use]
pub fn scheduler_span(operation: &str, campaign_id: &str) -> Span {
    tracing::info_span!(
        "scheduler",
        op = operation,
        campaign_id = campaign_id,
    )
}

/// Creates a span for a worker handling one message.
///
/// # Example
///
/// ```rust
/// use ringflow_core::observability::worker_span;
///
/// let span = worker_span("call.dispatch", "c0ffee..", "deadbeef..", 1);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn worker_span(operation: &str, campaign_id: &str, call_id: &str, attempt: u32) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        campaign_id = campaign_id,
        call_id = call_id,
        attempt = attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = worker_span("call.dispatch", "campaign", "call", 2);
        let _guard = span.enter();
        tracing::info!("test message in span");
    }
}
