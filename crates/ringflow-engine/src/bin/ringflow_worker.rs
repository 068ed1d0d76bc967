//! Worker service: runs the call, status, and retry workers in one process.
//!
//! Horizontally scalable; each instance joins the same consumer groups, so
//! partitions spread across replicas. Shutdown is a clean cancellation on
//! ctrl-c: in-flight messages finish or are left uncommitted for
//! redelivery.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use ringflow_core::observability::{init_logging, LogFormat};
use ringflow_engine::bus::kafka::KafkaBus;
use ringflow_engine::bus::MessageBus;
use ringflow_engine::config::EngineConfig;
use ringflow_engine::error::{Error, Result};
use ringflow_engine::store::postgres::{PostgresCallStore, PostgresMetadataStore};
use ringflow_engine::telephony::{MockProvider, Provider};
use ringflow_engine::throttle::redis::RedisSlotLimiter;
use ringflow_engine::topics::TopicSet;
use ringflow_engine::worker::{CallWorker, RetryWorker, StatusWorker};

fn log_format() -> LogFormat {
    match std::env::var("RINGFLOW_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn provider_for(name: &str) -> Arc<dyn Provider> {
    match name {
        "mock" | "" => Arc::new(MockProvider::new()),
        other => {
            tracing::warn!(provider = other, "unknown provider, falling back to mock");
            Arc::new(MockProvider::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format());

    let config_path = std::env::var("RINGFLOW_CONFIG").ok().map(PathBuf::from);
    let config = EngineConfig::load(config_path.as_deref())?;

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .connect(&config.postgres.url)
        .await
        .map_err(|e| Error::storage_with_source("connect to postgres", e))?;

    let metadata = Arc::new(PostgresMetadataStore::new(pool.clone()));
    metadata.ensure_schema().await?;
    let calls = Arc::new(PostgresCallStore::new(pool));
    calls.ensure_schema().await?;

    let bus: Arc<dyn MessageBus> = Arc::new(KafkaBus::new(&config.kafka)?);
    let topics = TopicSet::from_config(&config.kafka);
    bus.ensure_topics(&topics.provisioning_plan()).await?;

    let limiter = Arc::new(RedisSlotLimiter::with_ttl(
        &config.redis.url,
        config.throttle.slot_ttl,
    )?);
    let provider = provider_for(&config.call_bridge.provider_name);

    let call_worker = CallWorker::new(
        bus.clone(),
        topics.clone(),
        limiter,
        provider,
        config.throttle.default_per_campaign,
        config.call_bridge.request_timeout,
    );
    let status_worker = StatusWorker::new(bus.clone(), topics.clone(), metadata, calls.clone());
    let retry_worker = RetryWorker::new(bus, topics);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    tracing::info!("workers starting");
    tokio::try_join!(
        call_worker.run(cancel.clone()),
        status_worker.run(cancel.clone()),
        retry_worker.run(cancel.clone()),
    )?;
    Ok(())
}
