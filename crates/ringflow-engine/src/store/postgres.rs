//! Postgres store adapters.
//!
//! `PostgresMetadataStore` implements the campaign, target, and counter
//! repositories over the relational schema (`campaigns`,
//! `campaign_business_hours`, `campaign_targets`, `campaign_statistics`).
//! `PostgresCallStore` implements the write-heavy attempt store, keeping the
//! wide-column layout: a primary `calls` row per call, `calls_by_campaign`
//! and `calls_by_status` projections bucketed by creation date, and the
//! append-only `call_attempts` table keyed by `(call_id, attempt_number)`.
//!
//! The scheduler claim uses `FOR UPDATE SKIP LOCKED` inside a single
//! statement, so concurrent schedulers partition the pending set instead of
//! double-claiming.
//!
//! This module is only compiled with the `postgres` feature.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use ringflow_core::{
    BusinessHourWindow, Call, CallAttempt, CallId, CallStatus, Campaign, CampaignId,
    CampaignStats, CampaignStatus, CampaignTarget, RetryPolicy, StatsDelta, TargetId, TargetState,
};

use super::{CallStore, CampaignStore, StatsStore, TargetStore};
use crate::error::{Error, Result};

/// DDL for the metadata schema, applied idempotently at startup.
const METADATA_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS campaigns (
    id                  UUID PRIMARY KEY,
    name                TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    timezone            TEXT NOT NULL,
    max_concurrent_calls INTEGER NOT NULL,
    retry_max_attempts  INTEGER NOT NULL,
    retry_base_ms       BIGINT NOT NULL,
    retry_max_ms        BIGINT NOT NULL,
    retry_jitter        DOUBLE PRECISION NOT NULL,
    status              TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    started_at          TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS campaigns_name_lower_idx ON campaigns (lower(name));

CREATE TABLE IF NOT EXISTS campaign_business_hours (
    campaign_id  UUID NOT NULL REFERENCES campaigns (id) ON DELETE CASCADE,
    day_of_week  SMALLINT NOT NULL,
    start_minute SMALLINT NOT NULL,
    end_minute   SMALLINT NOT NULL
);
CREATE INDEX IF NOT EXISTS campaign_business_hours_campaign_idx
    ON campaign_business_hours (campaign_id);

CREATE TABLE IF NOT EXISTS campaign_targets (
    id              UUID PRIMARY KEY,
    campaign_id     UUID NOT NULL REFERENCES campaigns (id) ON DELETE CASCADE,
    phone_number    TEXT NOT NULL,
    payload         JSONB,
    state           TEXT NOT NULL,
    scheduled_at    TIMESTAMPTZ,
    last_attempt_at TIMESTAMPTZ,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS campaign_targets_claim_idx
    ON campaign_targets (campaign_id, state, created_at);

CREATE TABLE IF NOT EXISTS campaign_statistics (
    campaign_id       UUID PRIMARY KEY REFERENCES campaigns (id) ON DELETE CASCADE,
    total_calls       BIGINT NOT NULL DEFAULT 0,
    completed_calls   BIGINT NOT NULL DEFAULT 0,
    failed_calls      BIGINT NOT NULL DEFAULT 0,
    in_progress_calls BIGINT NOT NULL DEFAULT 0,
    pending_calls     BIGINT NOT NULL DEFAULT 0,
    retries_scheduled BIGINT NOT NULL DEFAULT 0,
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS campaign_events (
    id          BIGSERIAL PRIMARY KEY,
    campaign_id UUID NOT NULL,
    event_type  TEXT NOT NULL,
    detail      JSONB,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// DDL for the attempt-store schema, applied idempotently at startup.
const CALL_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS calls (
    id              UUID PRIMARY KEY,
    campaign_id     UUID NOT NULL,
    bucket          DATE NOT NULL,
    phone_number    TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    last_attempt_at TIMESTAMPTZ,
    scheduled_at    TIMESTAMPTZ NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS calls_by_campaign (
    campaign_id UUID NOT NULL,
    bucket      DATE NOT NULL,
    call_id     UUID NOT NULL,
    PRIMARY KEY (campaign_id, bucket, call_id)
);

CREATE TABLE IF NOT EXISTS calls_by_status (
    campaign_id UUID NOT NULL,
    status      TEXT NOT NULL,
    bucket      DATE NOT NULL,
    call_id     UUID NOT NULL,
    PRIMARY KEY (campaign_id, status, bucket, call_id)
);

CREATE TABLE IF NOT EXISTS call_attempts (
    call_id        UUID NOT NULL,
    attempt_number INTEGER NOT NULL,
    status         TEXT NOT NULL,
    error          TEXT,
    created_at     TIMESTAMPTZ NOT NULL,
    duration_ms    BIGINT NOT NULL,
    PRIMARY KEY (call_id, attempt_number)
);
";

fn storage_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::storage_with_source(context, e)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign> {
    let status: String = row.try_get("status").map_err(storage_err("read status"))?;
    let base_ms: i64 = row
        .try_get("retry_base_ms")
        .map_err(storage_err("read retry_base_ms"))?;
    let max_ms: i64 = row
        .try_get("retry_max_ms")
        .map_err(storage_err("read retry_max_ms"))?;
    let max_attempts: i32 = row
        .try_get("retry_max_attempts")
        .map_err(storage_err("read retry_max_attempts"))?;

    Ok(Campaign {
        id: CampaignId::from_uuid(row.try_get("id").map_err(storage_err("read id"))?),
        name: row.try_get("name").map_err(storage_err("read name"))?,
        description: row
            .try_get("description")
            .map_err(storage_err("read description"))?,
        timezone: row
            .try_get("timezone")
            .map_err(storage_err("read timezone"))?,
        business_hours: Vec::new(),
        max_concurrent_calls: row
            .try_get("max_concurrent_calls")
            .map_err(storage_err("read max_concurrent_calls"))?,
        retry_policy: RetryPolicy {
            max_attempts: u32::try_from(max_attempts).unwrap_or(1),
            base_delay: Duration::from_millis(u64::try_from(base_ms).unwrap_or(0)),
            max_delay: Duration::from_millis(u64::try_from(max_ms).unwrap_or(0)),
            jitter: row
                .try_get("retry_jitter")
                .map_err(storage_err("read retry_jitter"))?,
        },
        status: CampaignStatus::parse(&status)?,
        created_at: row
            .try_get("created_at")
            .map_err(storage_err("read created_at"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(storage_err("read updated_at"))?,
        started_at: row
            .try_get("started_at")
            .map_err(storage_err("read started_at"))?,
        completed_at: row
            .try_get("completed_at")
            .map_err(storage_err("read completed_at"))?,
    })
}

fn target_from_row(row: &PgRow) -> Result<CampaignTarget> {
    let state: String = row.try_get("state").map_err(storage_err("read state"))?;
    let payload: Option<serde_json::Value> = row
        .try_get("payload")
        .map_err(storage_err("read payload"))?;
    let payload = payload.and_then(|value| match value {
        serde_json::Value::Object(map) => Some(map.into_iter().collect::<HashMap<_, _>>()),
        _ => None,
    });
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(storage_err("read attempt_count"))?;

    Ok(CampaignTarget {
        id: TargetId::from_uuid(row.try_get("id").map_err(storage_err("read id"))?),
        campaign_id: CampaignId::from_uuid(
            row.try_get("campaign_id")
                .map_err(storage_err("read campaign_id"))?,
        ),
        phone_number: row
            .try_get("phone_number")
            .map_err(storage_err("read phone_number"))?,
        payload,
        state: TargetState::parse(&state)?,
        scheduled_at: row
            .try_get("scheduled_at")
            .map_err(storage_err("read scheduled_at"))?,
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(storage_err("read last_attempt_at"))?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        created_at: row
            .try_get("created_at")
            .map_err(storage_err("read created_at"))?,
    })
}

fn call_from_row(row: &PgRow) -> Result<Call> {
    let status: String = row.try_get("status").map_err(storage_err("read status"))?;
    let attempt_count: i32 = row
        .try_get("attempt_count")
        .map_err(storage_err("read attempt_count"))?;
    Ok(Call {
        id: CallId::from_uuid(row.try_get("id").map_err(storage_err("read id"))?),
        campaign_id: CampaignId::from_uuid(
            row.try_get("campaign_id")
                .map_err(storage_err("read campaign_id"))?,
        ),
        phone_number: row
            .try_get("phone_number")
            .map_err(storage_err("read phone_number"))?,
        status: CallStatus::parse(&status)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(storage_err("read last_attempt_at"))?,
        scheduled_at: row
            .try_get("scheduled_at")
            .map_err(storage_err("read scheduled_at"))?,
        created_at: row
            .try_get("created_at")
            .map_err(storage_err("read created_at"))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(storage_err("read updated_at"))?,
        last_error: row
            .try_get("last_error")
            .map_err(storage_err("read last_error"))?,
    })
}

/// Postgres-backed metadata store.
#[derive(Clone)]
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the metadata DDL idempotently.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the DDL cannot be applied.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(METADATA_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_err("apply metadata schema"))?;
        Ok(())
    }

    async fn load_business_hours(&self, id: CampaignId) -> Result<Vec<BusinessHourWindow>> {
        let rows = sqlx::query(
            "SELECT day_of_week, start_minute, end_minute
             FROM campaign_business_hours WHERE campaign_id = $1
             ORDER BY day_of_week, start_minute",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("list business hours"))?;

        rows.iter()
            .map(|row| {
                let day: i16 = row
                    .try_get("day_of_week")
                    .map_err(storage_err("read day_of_week"))?;
                let start: i16 = row
                    .try_get("start_minute")
                    .map_err(storage_err("read start_minute"))?;
                let end: i16 = row
                    .try_get("end_minute")
                    .map_err(storage_err("read end_minute"))?;
                Ok(BusinessHourWindow {
                    day_of_week: u8::try_from(day).unwrap_or(0),
                    start_minute: u16::try_from(start).unwrap_or(0),
                    end_minute: u16::try_from(end).unwrap_or(0),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CampaignStore for PostgresMetadataStore {
    async fn create(&self, campaign: &Campaign) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO campaigns (
                id, name, description, timezone, max_concurrent_calls,
                retry_max_attempts, retry_base_ms, retry_max_ms, retry_jitter,
                status, created_at, updated_at, started_at, completed_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(campaign.id.as_uuid())
        .bind(&campaign.name)
        .bind(&campaign.description)
        .bind(&campaign.timezone)
        .bind(campaign.max_concurrent_calls)
        .bind(i32::try_from(campaign.retry_policy.max_attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(campaign.retry_policy.base_delay.as_millis()).unwrap_or(i64::MAX))
        .bind(i64::try_from(campaign.retry_policy.max_delay.as_millis()).unwrap_or(i64::MAX))
        .bind(campaign.retry_policy.jitter)
        .bind(campaign.status.as_str())
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.replace_business_hours(campaign.id, &campaign.business_hours)
                    .await
            }
            Err(e) if is_unique_violation(&e) => Err(Error::conflict(format!(
                "campaign name '{}' already exists",
                campaign.name
            ))),
            Err(e) => Err(Error::storage_with_source("create campaign", e)),
        }
    }

    async fn get(&self, id: CampaignId) -> Result<Campaign> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("get campaign"))?
            .ok_or_else(|| Error::not_found("campaign", id))?;

        let mut campaign = campaign_from_row(&row)?;
        campaign.business_hours = self.load_business_hours(id).await?;
        Ok(campaign)
    }

    async fn update(&self, campaign: &Campaign) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET
                name = $2, description = $3, timezone = $4,
                max_concurrent_calls = $5, retry_max_attempts = $6,
                retry_base_ms = $7, retry_max_ms = $8, retry_jitter = $9,
                status = $10, updated_at = $11, started_at = $12,
                completed_at = $13
             WHERE id = $1",
        )
        .bind(campaign.id.as_uuid())
        .bind(&campaign.name)
        .bind(&campaign.description)
        .bind(&campaign.timezone)
        .bind(campaign.max_concurrent_calls)
        .bind(i32::try_from(campaign.retry_policy.max_attempts).unwrap_or(i32::MAX))
        .bind(i64::try_from(campaign.retry_policy.base_delay.as_millis()).unwrap_or(i64::MAX))
        .bind(i64::try_from(campaign.retry_policy.max_delay.as_millis()).unwrap_or(i64::MAX))
        .bind(campaign.retry_policy.jitter)
        .bind(campaign.status.as_str())
        .bind(campaign.updated_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("update campaign"))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("campaign", campaign.id));
        }
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> Result<Vec<Campaign>> {
        let rows = sqlx::query(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("list campaigns by status"))?;

        let mut campaigns = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut campaign = campaign_from_row(row)?;
            campaign.business_hours = self.load_business_hours(campaign.id).await?;
            campaigns.push(campaign);
        }
        Ok(campaigns)
    }

    async fn replace_business_hours(
        &self,
        id: CampaignId,
        windows: &[BusinessHourWindow],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("begin business hours tx"))?;

        sqlx::query("DELETE FROM campaign_business_hours WHERE campaign_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage_err("clear business hours"))?;

        for window in windows {
            sqlx::query(
                "INSERT INTO campaign_business_hours
                    (campaign_id, day_of_week, start_minute, end_minute)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id.as_uuid())
            .bind(i16::from(window.day_of_week))
            .bind(i16::try_from(window.start_minute).unwrap_or(0))
            .bind(i16::try_from(window.end_minute).unwrap_or(0))
            .execute(&mut *tx)
            .await
            .map_err(storage_err("insert business hour window"))?;
        }

        tx.commit()
            .await
            .map_err(storage_err("commit business hours tx"))
    }

    async fn delete(&self, id: CampaignId) -> Result<()> {
        sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(storage_err("delete campaign"))?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for PostgresMetadataStore {
    async fn bulk_insert(&self, targets: &[CampaignTarget]) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("begin target insert tx"))?;

        for target in targets {
            let payload = target
                .payload
                .as_ref()
                .map(|map| serde_json::to_value(map))
                .transpose()?;
            sqlx::query(
                "INSERT INTO campaign_targets (
                    id, campaign_id, phone_number, payload, state,
                    scheduled_at, last_attempt_at, attempt_count,
                    created_at, updated_at
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(target.id.as_uuid())
            .bind(target.campaign_id.as_uuid())
            .bind(&target.phone_number)
            .bind(payload)
            .bind(target.state.as_str())
            .bind(target.scheduled_at)
            .bind(target.last_attempt_at)
            .bind(i32::try_from(target.attempt_count).unwrap_or(0))
            .bind(target.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("insert target"))?;
        }

        tx.commit().await.map_err(storage_err("commit target insert"))
    }

    async fn claim_batch(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignTarget>> {
        // Single-statement claim: select-for-update with SKIP LOCKED keeps
        // competing schedulers from double-claiming, and the UPDATE makes
        // the pending -> queued transition atomic with the selection.
        let rows = sqlx::query(
            "UPDATE campaign_targets SET state = 'queued', scheduled_at = $3, updated_at = $3
             WHERE id IN (
                 SELECT id FROM campaign_targets
                 WHERE campaign_id = $1 AND state = 'pending'
                 ORDER BY created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, campaign_id, phone_number, payload, state,
                       scheduled_at, last_attempt_at, attempt_count, created_at",
        )
        .bind(campaign_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("claim target batch"))?;

        rows.iter().map(target_from_row).collect()
    }

    async fn set_state(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
        state: TargetState,
    ) -> Result<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = target_ids.iter().map(|id| id.as_uuid()).collect();
        // Terminal states are excluded in SQL so a stale revert can never
        // resurrect a finished target.
        sqlx::query(
            "UPDATE campaign_targets SET state = $1, updated_at = NOW()
             WHERE campaign_id = $2 AND id = ANY($3)
               AND state NOT IN ('done', 'failed')",
        )
        .bind(state.as_str())
        .bind(campaign_id.as_uuid())
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(storage_err("set target state"))?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        terminal: Option<TargetState>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let state = terminal.unwrap_or(TargetState::InFlight);
        sqlx::query(
            "UPDATE campaign_targets SET
                state = $3,
                attempt_count = attempt_count + 1,
                last_attempt_at = $4,
                updated_at = $4
             WHERE campaign_id = $1 AND phone_number = $2
               AND state NOT IN ('done', 'failed')",
        )
        .bind(campaign_id.as_uuid())
        .bind(phone_number)
        .bind(state.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err("record target outcome"))?;
        Ok(())
    }

    async fn contains_phone(&self, campaign_id: CampaignId, phone_number: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM campaign_targets
             WHERE campaign_id = $1 AND phone_number = $2 LIMIT 1",
        )
        .bind(campaign_id.as_uuid())
        .bind(phone_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("check target membership"))?;
        Ok(row.is_some())
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        state: Option<TargetState>,
        limit: usize,
    ) -> Result<Vec<CampaignTarget>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = if let Some(state) = state {
            sqlx::query(
                "SELECT id, campaign_id, phone_number, payload, state,
                        scheduled_at, last_attempt_at, attempt_count, created_at
                 FROM campaign_targets
                 WHERE campaign_id = $1 AND state = $2
                 ORDER BY created_at ASC LIMIT $3",
            )
            .bind(campaign_id.as_uuid())
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT id, campaign_id, phone_number, payload, state,
                        scheduled_at, last_attempt_at, attempt_count, created_at
                 FROM campaign_targets
                 WHERE campaign_id = $1
                 ORDER BY created_at ASC LIMIT $2",
            )
            .bind(campaign_id.as_uuid())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(storage_err("list targets"))?;

        rows.iter().map(target_from_row).collect()
    }
}

#[async_trait]
impl StatsStore for PostgresMetadataStore {
    async fn ensure(&self, campaign_id: CampaignId) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_statistics (campaign_id)
             VALUES ($1) ON CONFLICT (campaign_id) DO NOTHING",
        )
        .bind(campaign_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(storage_err("ensure statistics row"))?;
        Ok(())
    }

    async fn get(&self, campaign_id: CampaignId) -> Result<CampaignStats> {
        let row = sqlx::query(
            "SELECT total_calls, completed_calls, failed_calls,
                    in_progress_calls, pending_calls, retries_scheduled
             FROM campaign_statistics WHERE campaign_id = $1",
        )
        .bind(campaign_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("get statistics"))?
        .ok_or_else(|| Error::not_found("campaign statistics", campaign_id))?;

        Ok(CampaignStats {
            total_calls: row
                .try_get("total_calls")
                .map_err(storage_err("read total_calls"))?,
            completed_calls: row
                .try_get("completed_calls")
                .map_err(storage_err("read completed_calls"))?,
            failed_calls: row
                .try_get("failed_calls")
                .map_err(storage_err("read failed_calls"))?,
            in_progress_calls: row
                .try_get("in_progress_calls")
                .map_err(storage_err("read in_progress_calls"))?,
            pending_calls: row
                .try_get("pending_calls")
                .map_err(storage_err("read pending_calls"))?,
            retries_scheduled: row
                .try_get("retries_scheduled")
                .map_err(storage_err("read retries_scheduled"))?,
        })
    }

    async fn apply_delta(&self, campaign_id: CampaignId, delta: StatsDelta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE campaign_statistics SET
                total_calls = total_calls + $2,
                completed_calls = completed_calls + $3,
                failed_calls = failed_calls + $4,
                in_progress_calls = in_progress_calls + $5,
                pending_calls = pending_calls + $6,
                retries_scheduled = retries_scheduled + $7,
                updated_at = NOW()
             WHERE campaign_id = $1",
        )
        .bind(campaign_id.as_uuid())
        .bind(delta.total_calls)
        .bind(delta.completed_calls)
        .bind(delta.failed_calls)
        .bind(delta.in_progress_calls)
        .bind(delta.pending_calls)
        .bind(delta.retries_scheduled)
        .execute(&self.pool)
        .await
        .map_err(storage_err("apply statistics delta"))?;
        Ok(())
    }
}

/// Postgres-backed attempt store preserving the wide-column layout.
#[derive(Clone)]
pub struct PostgresCallStore {
    pool: PgPool,
}

impl PostgresCallStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the attempt-store DDL idempotently.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the DDL cannot be applied.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(CALL_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(storage_err("apply call schema"))?;
        Ok(())
    }

    fn bucket_of(created_at: DateTime<Utc>) -> NaiveDate {
        created_at.date_naive()
    }
}

#[async_trait]
impl CallStore for PostgresCallStore {
    async fn create_call(&self, call: &Call) -> Result<()> {
        let bucket = Self::bucket_of(call.created_at);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("begin call insert tx"))?;

        sqlx::query(
            "INSERT INTO calls (
                id, campaign_id, bucket, phone_number, status, attempt_count,
                last_error, last_attempt_at, scheduled_at, created_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(call.id.as_uuid())
        .bind(call.campaign_id.as_uuid())
        .bind(bucket)
        .bind(&call.phone_number)
        .bind(call.status.as_str())
        .bind(i32::try_from(call.attempt_count).unwrap_or(0))
        .bind(&call.last_error)
        .bind(call.last_attempt_at)
        .bind(call.scheduled_at)
        .bind(call.created_at)
        .bind(call.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err("insert call"))?;

        sqlx::query(
            "INSERT INTO calls_by_campaign (campaign_id, bucket, call_id)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(call.campaign_id.as_uuid())
        .bind(bucket)
        .bind(call.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(storage_err("insert calls_by_campaign row"))?;

        sqlx::query(
            "INSERT INTO calls_by_status (campaign_id, status, bucket, call_id)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(call.campaign_id.as_uuid())
        .bind(call.status.as_str())
        .bind(bucket)
        .bind(call.id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(storage_err("insert calls_by_status row"))?;

        tx.commit().await.map_err(storage_err("commit call insert"))
    }

    async fn update_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
        attempt: u32,
        error: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("begin status update tx"))?;

        let existing = sqlx::query(
            "SELECT campaign_id, bucket, status, attempt_count
             FROM calls WHERE id = $1 FOR UPDATE",
        )
        .bind(call_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err("lock call row"))?
        .ok_or_else(|| Error::not_found("call", call_id))?;

        let applied_attempt: i32 = existing
            .try_get("attempt_count")
            .map_err(storage_err("read attempt_count"))?;
        if i64::from(attempt) <= i64::from(applied_attempt) {
            tx.rollback()
                .await
                .map_err(storage_err("rollback redelivered update"))?;
            return Ok(false);
        }

        let campaign_id: Uuid = existing
            .try_get("campaign_id")
            .map_err(storage_err("read campaign_id"))?;
        let bucket: NaiveDate = existing.try_get("bucket").map_err(storage_err("read bucket"))?;
        let old_status: String = existing.try_get("status").map_err(storage_err("read status"))?;

        sqlx::query(
            "UPDATE calls SET status = $2, attempt_count = $3, last_error = $4,
                    last_attempt_at = $5, updated_at = $5
             WHERE id = $1",
        )
        .bind(call_id.as_uuid())
        .bind(status.as_str())
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(error)
        .bind(occurred_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_err("update call row"))?;

        if old_status != status.as_str() {
            sqlx::query(
                "DELETE FROM calls_by_status
                 WHERE campaign_id = $1 AND status = $2 AND bucket = $3 AND call_id = $4",
            )
            .bind(campaign_id)
            .bind(&old_status)
            .bind(bucket)
            .bind(call_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage_err("remove old status index row"))?;

            sqlx::query(
                "INSERT INTO calls_by_status (campaign_id, status, bucket, call_id)
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
            )
            .bind(campaign_id)
            .bind(status.as_str())
            .bind(bucket)
            .bind(call_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(storage_err("insert new status index row"))?;
        }

        tx.commit().await.map_err(storage_err("commit status update"))?;
        Ok(true)
    }

    async fn get_call(&self, call_id: CallId) -> Result<Call> {
        let row = sqlx::query(
            "SELECT id, campaign_id, phone_number, status, attempt_count,
                    last_error, last_attempt_at, scheduled_at, created_at, updated_at
             FROM calls WHERE id = $1",
        )
        .bind(call_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("get call"))?
        .ok_or_else(|| Error::not_found("call", call_id))?;

        call_from_row(&row)
    }

    async fn append_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_attempts
                (call_id, attempt_number, status, error, created_at, duration_ms)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (call_id, attempt_number) DO NOTHING",
        )
        .bind(attempt.call_id.as_uuid())
        .bind(i32::try_from(attempt.attempt_num).unwrap_or(i32::MAX))
        .bind(attempt.status.as_str())
        .bind(&attempt.error)
        .bind(attempt.created_at)
        .bind(i64::try_from(attempt.duration.as_millis()).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(storage_err("append attempt"))?;
        Ok(())
    }

    async fn list_attempts(&self, call_id: CallId) -> Result<Vec<CallAttempt>> {
        let rows = sqlx::query(
            "SELECT call_id, attempt_number, status, error, created_at, duration_ms
             FROM call_attempts WHERE call_id = $1 ORDER BY attempt_number ASC",
        )
        .bind(call_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("list attempts"))?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(storage_err("read status"))?;
                let attempt_number: i32 = row
                    .try_get("attempt_number")
                    .map_err(storage_err("read attempt_number"))?;
                let duration_ms: i64 = row
                    .try_get("duration_ms")
                    .map_err(storage_err("read duration_ms"))?;
                Ok(CallAttempt {
                    // Attempt identity is (call_id, attempt_number); the row
                    // UUID is not stored, so mint one for the in-memory view.
                    id: ringflow_core::AttemptId::generate(),
                    call_id: CallId::from_uuid(
                        row.try_get("call_id").map_err(storage_err("read call_id"))?,
                    ),
                    attempt_num: u32::try_from(attempt_number).unwrap_or(0),
                    status: CallStatus::parse(&status)?,
                    error: row.try_get("error").map_err(storage_err("read error"))?,
                    duration: Duration::from_millis(u64::try_from(duration_ms).unwrap_or(0)),
                    created_at: row
                        .try_get("created_at")
                        .map_err(storage_err("read created_at"))?,
                })
            })
            .collect()
    }

    async fn list_calls_by_campaign(
        &self,
        campaign_id: CampaignId,
        limit: usize,
    ) -> Result<Vec<Call>> {
        let rows = sqlx::query(
            "SELECT c.id, c.campaign_id, c.phone_number, c.status, c.attempt_count,
                    c.last_error, c.last_attempt_at, c.scheduled_at, c.created_at, c.updated_at
             FROM calls_by_campaign cb
             JOIN calls c ON c.id = cb.call_id
             WHERE cb.campaign_id = $1
             ORDER BY cb.bucket DESC, cb.call_id DESC
             LIMIT $2",
        )
        .bind(campaign_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("list calls by campaign"))?;

        rows.iter().map(call_from_row).collect()
    }
}
