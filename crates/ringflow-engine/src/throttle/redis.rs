//! Redis slot limiter.
//!
//! Production implementation of [`SlotLimiter`] over Redis. Both operations
//! run as server-side Lua scripts so read-modify-write is atomic across
//! workers, and the acquire path refreshes the key TTL so slots leaked by a
//! dead worker expire on their own.
//!
//! This module is only compiled with the `redis` feature.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;

use ringflow_core::CampaignId;

use super::{slot_key, SlotLimiter, DEFAULT_SLOT_TTL};
use crate::error::{Error, Result};

/// Acquire: increment below the limit and refresh the TTL, else refuse.
const ACQUIRE_SCRIPT: &str = r"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', key) or '0')
if current < limit then
  current = redis.call('INCR', key)
  if ttl > 0 then
    redis.call('PEXPIRE', key, ttl)
  end
  return 1
end
return 0
";

/// Release: decrement, deleting the key instead of going negative.
const RELEASE_SCRIPT: &str = r"
local key = KEYS[1]
local current = tonumber(redis.call('GET', key) or '0')
if current <= 0 then
  redis.call('DEL', key)
  return 0
end
return redis.call('DECR', key)
";

/// Redis-backed slot limiter.
pub struct RedisSlotLimiter {
    client: redis::Client,
    acquire: Script,
    release: Script,
    ttl: Duration,
}

impl RedisSlotLimiter {
    /// Connects to the throttle store at `url` with the default slot TTL.
    ///
    /// # Errors
    ///
    /// Returns a throttle error when the URL is invalid.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_ttl(url, DEFAULT_SLOT_TTL)
    }

    /// Connects with a custom slot TTL.
    ///
    /// # Errors
    ///
    /// Returns a throttle error when the URL is invalid.
    pub fn with_ttl(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::throttle(format!("open redis client: {e}")))?;
        Ok(Self {
            client,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            ttl,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::throttle(format!("redis connection: {e}")))
    }
}

#[async_trait]
impl SlotLimiter for RedisSlotLimiter {
    async fn try_acquire(&self, campaign_id: CampaignId, limit: i32) -> Result<bool> {
        if limit <= 0 {
            return Ok(true);
        }
        let mut conn = self.connection().await?;
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let granted: i64 = self
            .acquire
            .key(slot_key(campaign_id))
            .arg(limit)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::throttle(format!("acquire slot: {e}")))?;
        Ok(granted == 1)
    }

    async fn release(&self, campaign_id: CampaignId) -> Result<()> {
        let mut conn = self.connection().await?;
        let _remaining: i64 = self
            .release
            .key(slot_key(campaign_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::throttle(format!("release slot: {e}")))?;
        Ok(())
    }

    async fn active(&self, campaign_id: CampaignId) -> Result<i64> {
        let mut conn = self.connection().await?;
        let count: Option<i64> = redis::cmd("GET")
            .arg(slot_key(campaign_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::throttle(format!("read slot count: {e}")))?;
        Ok(count.unwrap_or(0))
    }
}
