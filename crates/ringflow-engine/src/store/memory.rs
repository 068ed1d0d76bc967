//! In-memory store implementations for testing and development.
//!
//! State lives behind `RwLock`ed maps in one process. The claim path holds
//! the write lock for the whole select-and-transition, which gives it the
//! same no-double-claim guarantee the Postgres adapter gets from
//! `FOR UPDATE SKIP LOCKED`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ringflow_core::{
    BusinessHourWindow, Call, CallAttempt, CallId, CallStatus, Campaign, CampaignId,
    CampaignStats, CampaignStatus, CampaignTarget, StatsDelta, TargetId, TargetState,
};

use super::{CallStore, CampaignStore, StatsStore, TargetStore};
use crate::error::{Error, Result};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("metadata store lock poisoned")
}

/// In-memory metadata store: campaigns, targets, and counters.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    targets: RwLock<HashMap<CampaignId, Vec<CampaignTarget>>>,
    stats: RwLock<HashMap<CampaignId, CampaignStats>>,
}

impl InMemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for InMemoryMetadataStore {
    async fn create(&self, campaign: &Campaign) -> Result<()> {
        let mut campaigns = self.campaigns.write().map_err(poison_err)?;
        let name_taken = campaigns
            .values()
            .any(|c| c.name.eq_ignore_ascii_case(&campaign.name));
        if name_taken {
            return Err(Error::conflict(format!(
                "campaign name '{}' already exists",
                campaign.name
            )));
        }
        campaigns.insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn get(&self, id: CampaignId) -> Result<Campaign> {
        let campaigns = self.campaigns.read().map_err(poison_err)?;
        campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("campaign", id))
    }

    async fn update(&self, campaign: &Campaign) -> Result<()> {
        let mut campaigns = self.campaigns.write().map_err(poison_err)?;
        match campaigns.get_mut(&campaign.id) {
            Some(existing) => {
                *existing = campaign.clone();
                Ok(())
            }
            None => Err(Error::not_found("campaign", campaign.id)),
        }
    }

    async fn list_by_status(
        &self,
        status: CampaignStatus,
        limit: usize,
    ) -> Result<Vec<Campaign>> {
        let campaigns = self.campaigns.read().map_err(poison_err)?;
        let mut matching: Vec<Campaign> = campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|c| c.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn replace_business_hours(
        &self,
        id: CampaignId,
        windows: &[BusinessHourWindow],
    ) -> Result<()> {
        let mut campaigns = self.campaigns.write().map_err(poison_err)?;
        match campaigns.get_mut(&id) {
            Some(campaign) => {
                campaign.business_hours = windows.to_vec();
                Ok(())
            }
            None => Err(Error::not_found("campaign", id)),
        }
    }

    async fn delete(&self, id: CampaignId) -> Result<()> {
        self.campaigns.write().map_err(poison_err)?.remove(&id);
        self.targets.write().map_err(poison_err)?.remove(&id);
        self.stats.write().map_err(poison_err)?.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl TargetStore for InMemoryMetadataStore {
    async fn bulk_insert(&self, targets: &[CampaignTarget]) -> Result<()> {
        let mut map = self.targets.write().map_err(poison_err)?;
        for target in targets {
            let list = map.entry(target.campaign_id).or_default();
            if !list.iter().any(|t| t.id == target.id) {
                list.push(target.clone());
            }
        }
        Ok(())
    }

    async fn claim_batch(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<CampaignTarget>> {
        let mut map = self.targets.write().map_err(poison_err)?;
        let Some(list) = map.get_mut(&campaign_id) else {
            return Ok(Vec::new());
        };

        let mut pending: Vec<&mut CampaignTarget> = list
            .iter_mut()
            .filter(|t| t.state == TargetState::Pending)
            .collect();
        pending.sort_by_key(|t| t.created_at);

        let mut claimed = Vec::new();
        for target in pending.into_iter().take(limit) {
            target.state = TargetState::Queued;
            target.scheduled_at = Some(now);
            claimed.push(target.clone());
        }
        Ok(claimed)
    }

    async fn set_state(
        &self,
        campaign_id: CampaignId,
        target_ids: &[TargetId],
        state: TargetState,
    ) -> Result<()> {
        let mut map = self.targets.write().map_err(poison_err)?;
        if let Some(list) = map.get_mut(&campaign_id) {
            for target in list.iter_mut() {
                if target_ids.contains(&target.id) && target.state.can_transition_to(state) {
                    target.state = state;
                }
            }
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        campaign_id: CampaignId,
        phone_number: &str,
        terminal: Option<TargetState>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut map = self.targets.write().map_err(poison_err)?;
        if let Some(list) = map.get_mut(&campaign_id) {
            if let Some(target) = list.iter_mut().find(|t| t.phone_number == phone_number) {
                if target.state.is_terminal() {
                    return Ok(());
                }
                target.attempt_count += 1;
                target.last_attempt_at = Some(now);
                // The queued -> in_flight hop happens with the first
                // observed outcome; terminal outcomes settle the target.
                if target.state == TargetState::Queued {
                    target.state = TargetState::InFlight;
                }
                if let Some(terminal) = terminal {
                    if target.state.can_transition_to(terminal) {
                        target.state = terminal;
                    }
                }
            }
        }
        Ok(())
    }

    async fn contains_phone(&self, campaign_id: CampaignId, phone_number: &str) -> Result<bool> {
        let map = self.targets.read().map_err(poison_err)?;
        Ok(map
            .get(&campaign_id)
            .is_some_and(|list| list.iter().any(|t| t.phone_number == phone_number)))
    }

    async fn list_by_campaign(
        &self,
        campaign_id: CampaignId,
        state: Option<TargetState>,
        limit: usize,
    ) -> Result<Vec<CampaignTarget>> {
        let map = self.targets.read().map_err(poison_err)?;
        let mut targets: Vec<CampaignTarget> = map
            .get(&campaign_id)
            .map(|list| {
                list.iter()
                    .filter(|t| state.map_or(true, |s| t.state == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        targets.sort_by_key(|t| t.created_at);
        targets.truncate(limit);
        Ok(targets)
    }
}

#[async_trait]
impl StatsStore for InMemoryMetadataStore {
    async fn ensure(&self, campaign_id: CampaignId) -> Result<()> {
        self.stats
            .write()
            .map_err(poison_err)?
            .entry(campaign_id)
            .or_default();
        Ok(())
    }

    async fn get(&self, campaign_id: CampaignId) -> Result<CampaignStats> {
        let stats = self.stats.read().map_err(poison_err)?;
        stats
            .get(&campaign_id)
            .copied()
            .ok_or_else(|| Error::not_found("campaign statistics", campaign_id))
    }

    async fn apply_delta(&self, campaign_id: CampaignId, delta: StatsDelta) -> Result<()> {
        let mut stats = self.stats.write().map_err(poison_err)?;
        stats.entry(campaign_id).or_default().apply(delta);
        Ok(())
    }
}

/// In-memory attempt store: call rows plus append-only attempt history.
#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    calls: RwLock<HashMap<CallId, Call>>,
    attempts: RwLock<HashMap<CallId, BTreeMap<u32, CallAttempt>>>,
}

impl InMemoryCallStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create_call(&self, call: &Call) -> Result<()> {
        self.calls
            .write()
            .map_err(poison_err)?
            .insert(call.id, call.clone());
        Ok(())
    }

    async fn update_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
        attempt: u32,
        error: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut calls = self.calls.write().map_err(poison_err)?;
        let call = calls
            .get_mut(&call_id)
            .ok_or_else(|| Error::not_found("call", call_id))?;

        if attempt <= call.attempt_count {
            // Redelivery of an already-applied attempt.
            return Ok(false);
        }

        call.status = status;
        call.attempt_count = attempt;
        call.last_error = error.map(ToString::to_string);
        call.last_attempt_at = Some(occurred_at);
        call.updated_at = occurred_at;
        Ok(true)
    }

    async fn get_call(&self, call_id: CallId) -> Result<Call> {
        let calls = self.calls.read().map_err(poison_err)?;
        calls
            .get(&call_id)
            .cloned()
            .ok_or_else(|| Error::not_found("call", call_id))
    }

    async fn append_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        let mut attempts = self.attempts.write().map_err(poison_err)?;
        attempts
            .entry(attempt.call_id)
            .or_default()
            .entry(attempt.attempt_num)
            .or_insert_with(|| attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, call_id: CallId) -> Result<Vec<CallAttempt>> {
        let attempts = self.attempts.read().map_err(poison_err)?;
        Ok(attempts
            .get(&call_id)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_calls_by_campaign(
        &self,
        campaign_id: CampaignId,
        limit: usize,
    ) -> Result<Vec<Call>> {
        let calls = self.calls.read().map_err(poison_err)?;
        let mut matching: Vec<Call> = calls
            .values()
            .filter(|c| c.campaign_id == campaign_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringflow_core::RetryPolicy;

    fn campaign() -> Campaign {
        let now = Utc::now();
        Campaign {
            id: CampaignId::generate(),
            name: "renewals".into(),
            description: String::new(),
            timezone: "UTC".into(),
            business_hours: Vec::new(),
            max_concurrent_calls: 3,
            retry_policy: RetryPolicy::default(),
            status: CampaignStatus::InProgress,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    fn target(campaign_id: CampaignId, phone: &str, seq: i64) -> CampaignTarget {
        CampaignTarget {
            id: TargetId::generate(),
            campaign_id,
            phone_number: phone.into(),
            payload: None,
            state: TargetState::Pending,
            scheduled_at: None,
            last_attempt_at: None,
            attempt_count: 0,
            created_at: Utc::now() + chrono::Duration::milliseconds(seq),
        }
    }

    fn call(campaign_id: CampaignId) -> Call {
        let now = Utc::now();
        Call {
            id: CallId::generate(),
            campaign_id,
            phone_number: "+15550100".into(),
            status: CallStatus::Queued,
            attempt_count: 0,
            last_attempt_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn duplicate_names_conflict_case_insensitively() {
        let store = InMemoryMetadataStore::new();
        let first = campaign();
        store.create(&first).await.unwrap();

        let mut second = campaign();
        second.name = "RENEWALS".into();
        let err = store.create(&second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn claim_batch_is_oldest_first_and_exclusive() {
        let store = InMemoryMetadataStore::new();
        let c = campaign();
        store.create(&c).await.unwrap();
        store
            .bulk_insert(&[
                target(c.id, "+15550101", 0),
                target(c.id, "+15550102", 1),
                target(c.id, "+15550103", 2),
            ])
            .await
            .unwrap();

        let first = store.claim_batch(c.id, 2, Utc::now()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].phone_number, "+15550101");
        assert!(first.iter().all(|t| t.state == TargetState::Queued));
        assert!(first.iter().all(|t| t.scheduled_at.is_some()));

        // A competing claim sees only what is left.
        let second = store.claim_batch(c.id, 10, Utc::now()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].phone_number, "+15550103");
    }

    #[tokio::test]
    async fn revert_returns_target_to_pending() {
        let store = InMemoryMetadataStore::new();
        let c = campaign();
        store.create(&c).await.unwrap();
        store.bulk_insert(&[target(c.id, "+15550101", 0)]).await.unwrap();

        let claimed = store.claim_batch(c.id, 1, Utc::now()).await.unwrap();
        store
            .set_state(c.id, &[claimed[0].id], TargetState::Pending)
            .await
            .unwrap();

        let reclaimed = store.claim_batch(c.id, 1, Utc::now()).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn terminal_targets_never_revert() {
        let store = InMemoryMetadataStore::new();
        let c = campaign();
        store.create(&c).await.unwrap();
        store.bulk_insert(&[target(c.id, "+15550101", 0)]).await.unwrap();

        store.claim_batch(c.id, 1, Utc::now()).await.unwrap();
        store
            .record_outcome(c.id, "+15550101", Some(TargetState::Done), Utc::now())
            .await
            .unwrap();

        let targets = store.list_by_campaign(c.id, None, 10).await.unwrap();
        let id = targets[0].id;
        assert_eq!(targets[0].state, TargetState::Done);

        store.set_state(c.id, &[id], TargetState::Pending).await.unwrap();
        let after = store.list_by_campaign(c.id, None, 10).await.unwrap();
        assert_eq!(after[0].state, TargetState::Done);
    }

    #[tokio::test]
    async fn update_call_status_guards_redelivery() {
        let store = InMemoryCallStore::new();
        let c = call(CampaignId::generate());
        store.create_call(&c).await.unwrap();

        let applied = store
            .update_call_status(c.id, CallStatus::Failed, 1, Some("busy"), Utc::now())
            .await
            .unwrap();
        assert!(applied);

        // Redelivered attempt 1 is a no-op.
        let replay = store
            .update_call_status(c.id, CallStatus::Failed, 1, Some("busy"), Utc::now())
            .await
            .unwrap();
        assert!(!replay);

        let applied2 = store
            .update_call_status(c.id, CallStatus::Completed, 2, None, Utc::now())
            .await
            .unwrap();
        assert!(applied2);

        let fetched = store.get_call(c.id).await.unwrap();
        assert_eq!(fetched.attempt_count, 2);
        assert_eq!(fetched.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn append_attempt_is_idempotent_by_key() {
        let store = InMemoryCallStore::new();
        let c = call(CampaignId::generate());
        store.create_call(&c).await.unwrap();

        let attempt = CallAttempt {
            id: ringflow_core::AttemptId::generate(),
            call_id: c.id,
            attempt_num: 1,
            status: CallStatus::Failed,
            error: Some("busy".into()),
            duration: std::time::Duration::from_secs(2),
            created_at: Utc::now(),
        };
        store.append_attempt(&attempt).await.unwrap();

        // Same (call_id, attempt_num) under a fresh UUID: still one row.
        let replay = CallAttempt {
            id: ringflow_core::AttemptId::generate(),
            ..attempt.clone()
        };
        store.append_attempt(&replay).await.unwrap();

        let attempts = store.list_attempts(c.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].id, attempt.id);
    }

    #[tokio::test]
    async fn stats_deltas_accumulate() {
        let store = InMemoryMetadataStore::new();
        let id = CampaignId::generate();
        store.ensure(id).await.unwrap();
        StatsStore::apply_delta(&store, id, StatsDelta::dispatched())
            .await
            .unwrap();
        StatsStore::apply_delta(
            &store,
            id,
            StatsDelta {
                completed_calls: 1,
                pending_calls: -1,
                ..StatsDelta::default()
            },
        )
        .await
        .unwrap();

        let stats = StatsStore::get(&store, id).await.unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.completed_calls, 1);
        assert_eq!(stats.pending_calls, 0);
    }
}
