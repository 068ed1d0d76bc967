//! Campaign scheduler service.
//!
//! Runs the periodic tick loop against Postgres and Kafka. Configuration
//! comes from the TOML file named by `RINGFLOW_CONFIG` (optional) plus
//! `RINGFLOW_*` environment overrides; shutdown is a clean cancellation on
//! ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use ringflow_core::observability::{init_logging, LogFormat};
use ringflow_engine::bus::kafka::KafkaBus;
use ringflow_engine::bus::MessageBus;
use ringflow_engine::config::EngineConfig;
use ringflow_engine::error::{Error, Result};
use ringflow_engine::scheduler::CampaignScheduler;
use ringflow_engine::store::postgres::{PostgresCallStore, PostgresMetadataStore};
use ringflow_engine::topics::TopicSet;
use ringflow_engine::trigger::CallTrigger;

fn log_format() -> LogFormat {
    match std::env::var("RINGFLOW_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
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

    let trigger = Arc::new(CallTrigger::new(
        metadata.clone(),
        calls,
        bus.clone(),
        topics.clone(),
        config.retry.as_policy(),
        config.throttle.default_per_campaign,
    ));
    let scheduler = CampaignScheduler::new(
        config.scheduler.clone(),
        metadata,
        bus,
        topics,
        trigger,
    );

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

    tracing::info!(
        tick_interval = ?config.scheduler.tick_interval,
        "scheduler starting"
    );
    scheduler.run(cancel).await
}
