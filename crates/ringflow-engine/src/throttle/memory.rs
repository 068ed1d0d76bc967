//! In-memory slot limiter for testing and development.
//!
//! Mirrors the Redis script semantics, including TTL expiry of idle
//! counters, inside one process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ringflow_core::CampaignId;

use super::{SlotLimiter, DEFAULT_SLOT_TTL};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: i64,
    expires_at: Instant,
}

/// Converts a lock poison error to a throttle error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::throttle("slot limiter lock poisoned")
}

/// Single-process slot limiter.
#[derive(Debug)]
pub struct InMemorySlotLimiter {
    slots: RwLock<HashMap<CampaignId, Slot>>,
    ttl: Duration,
}

impl Default for InMemorySlotLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySlotLimiter {
    /// Creates a limiter with the default five-minute slot TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SLOT_TTL)
    }

    /// Creates a limiter with a custom slot TTL.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl SlotLimiter for InMemorySlotLimiter {
    async fn try_acquire(&self, campaign_id: CampaignId, limit: i32) -> Result<bool> {
        if limit <= 0 {
            return Ok(true);
        }

        let now = Instant::now();
        let mut slots = self.slots.write().map_err(poison_err)?;
        let entry = slots.entry(campaign_id).or_insert(Slot {
            count: 0,
            expires_at: now + self.ttl,
        });
        if entry.expires_at <= now {
            // A dead worker's leaked slots age out here.
            entry.count = 0;
        }
        if entry.count < i64::from(limit) {
            entry.count += 1;
            entry.expires_at = now + self.ttl;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, campaign_id: CampaignId) -> Result<()> {
        let mut slots = self.slots.write().map_err(poison_err)?;
        if let Some(entry) = slots.get_mut(&campaign_id) {
            if entry.count <= 1 {
                slots.remove(&campaign_id);
            } else {
                entry.count -= 1;
            }
        }
        Ok(())
    }

    async fn active(&self, campaign_id: CampaignId) -> Result<i64> {
        let slots = self.slots.read().map_err(poison_err)?;
        let count = slots
            .get(&campaign_id)
            .filter(|s| s.expires_at > Instant::now())
            .map_or(0, |s| s.count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_up_to_limit() {
        let limiter = InMemorySlotLimiter::new();
        let id = CampaignId::generate();

        assert!(limiter.try_acquire(id, 2).await.unwrap());
        assert!(limiter.try_acquire(id, 2).await.unwrap());
        assert!(!limiter.try_acquire(id, 2).await.unwrap());
        assert_eq!(limiter.active(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_frees_a_slot() {
        let limiter = InMemorySlotLimiter::new();
        let id = CampaignId::generate();

        assert!(limiter.try_acquire(id, 1).await.unwrap());
        assert!(!limiter.try_acquire(id, 1).await.unwrap());

        limiter.release(id).await.unwrap();
        assert!(limiter.try_acquire(id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_at_zero_deletes_the_key() {
        let limiter = InMemorySlotLimiter::new();
        let id = CampaignId::generate();

        limiter.release(id).await.unwrap();
        assert_eq!(limiter.active(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_positive_limit_disables_throttling() {
        let limiter = InMemorySlotLimiter::new();
        let id = CampaignId::generate();

        for _ in 0..50 {
            assert!(limiter.try_acquire(id, 0).await.unwrap());
        }
        assert_eq!(limiter.active(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_slots_age_out() {
        let limiter = InMemorySlotLimiter::with_ttl(Duration::from_millis(10));
        let id = CampaignId::generate();

        assert!(limiter.try_acquire(id, 1).await.unwrap());
        assert!(!limiter.try_acquire(id, 1).await.unwrap());

        tokio::time::sleep(Duration::from_millis(25)).await;

        // The leaked slot expired, so capacity is back.
        assert!(limiter.try_acquire(id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn campaigns_are_isolated() {
        let limiter = InMemorySlotLimiter::new();
        let a = CampaignId::generate();
        let b = CampaignId::generate();

        assert!(limiter.try_acquire(a, 1).await.unwrap());
        assert!(limiter.try_acquire(b, 1).await.unwrap());
        assert!(!limiter.try_acquire(a, 1).await.unwrap());
        assert_eq!(limiter.active(b).await.unwrap(), 1);
    }
}
