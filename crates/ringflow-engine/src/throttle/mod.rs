//! Per-campaign concurrency throttling.
//!
//! This module provides:
//!
//! - [`SlotLimiter`]: Trait over the distributed slot counter
//! - [`InMemorySlotLimiter`]: Single-process implementation for tests
//! - Redis implementation (feature `redis`) using atomic server-side scripts
//!
//! The counter at `outbound:campaign:{uuid}:active` is an advisory
//! semaphore: acquire increments while below the limit and refreshes a TTL,
//! release decrements and deletes at zero. The TTL bounds slot leakage when
//! a worker dies holding a slot — overshoot is at most the TTL, zero in
//! steady state.

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemorySlotLimiter;

use async_trait::async_trait;

use ringflow_core::CampaignId;

use crate::error::Result;

/// Default TTL on slot counters; greater than any plausible call duration.
pub const DEFAULT_SLOT_TTL: std::time::Duration = std::time::Duration::from_secs(300);

/// Builds the throttle-store key for a campaign.
#[must_use]
pub fn slot_key(campaign_id: CampaignId) -> String {
    format!("outbound:campaign:{campaign_id}:active")
}

/// Distributed per-campaign slot counter.
///
/// All operations are atomic on the backend; callers loop on
/// [`SlotLimiter::try_acquire`] rather than blocking inside the store.
#[async_trait]
pub trait SlotLimiter: Send + Sync {
    /// Attempts to reserve one slot for the campaign under `limit`.
    ///
    /// A non-positive `limit` disables throttling and reserves nothing;
    /// such acquisitions must not be paired with a release.
    ///
    /// # Errors
    ///
    /// Returns a throttle error on backend failure; callers retry.
    async fn try_acquire(&self, campaign_id: CampaignId, limit: i32) -> Result<bool>;

    /// Releases one previously reserved slot.
    ///
    /// Releasing at zero deletes the key instead of going negative.
    ///
    /// # Errors
    ///
    /// Returns a throttle error on backend failure.
    async fn release(&self, campaign_id: CampaignId) -> Result<()>;

    /// Returns the current observed slot count for a campaign.
    ///
    /// # Errors
    ///
    /// Returns a throttle error on backend failure.
    async fn active(&self, campaign_id: CampaignId) -> Result<i64>;
}
