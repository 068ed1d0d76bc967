//! Topic and consumer-group wiring for the message log.
//!
//! The engine routes work through four topic roles: `dispatch`, `status`,
//! the tiered `retry.1..retry.N` delay lanes, and `deadletter` for envelopes
//! past attempt exhaustion. Partition counts default to 48 for the hot
//! topics and 12 for `deadletter`, overridable per deployment through the
//! `*_PARTITIONS` environment variables.

use crate::config::KafkaConfig;

/// Default partition count for `dispatch`, `status`, and each retry tier.
pub const DEFAULT_HOT_PARTITIONS: i32 = 48;
/// Default partition count for `deadletter`.
pub const DEFAULT_DEADLETTER_PARTITIONS: i32 = 12;

/// The set of topics one engine deployment operates on.
#[derive(Debug, Clone)]
pub struct TopicSet {
    /// Dispatch topic name.
    pub dispatch: String,
    /// Status topic name.
    pub status: String,
    /// Retry tier topic names, index 0 = tier 1.
    pub retry: Vec<String>,
    /// Deadletter topic name.
    pub deadletter: String,
    /// Base consumer group id for the call worker.
    pub consumer_group: String,
    /// Base consumer group id for retry workers; tiers append `-{k}`.
    pub retry_consumer_group: String,
}

impl TopicSet {
    /// Builds the topic set from the kafka configuration section.
    #[must_use]
    pub fn from_config(config: &KafkaConfig) -> Self {
        let retry_consumer_group = if config.retry_consumer_group_id.is_empty() {
            format!("{}-retry", config.consumer_group_id)
        } else {
            config.retry_consumer_group_id.clone()
        };
        Self {
            dispatch: config.dispatch_topic.clone(),
            status: config.status_topic.clone(),
            retry: config.retry_topics.clone(),
            deadletter: config.deadletter_topic.clone(),
            consumer_group: config.consumer_group_id.clone(),
            retry_consumer_group,
        }
    }

    /// Number of retry tiers (N).
    #[must_use]
    pub fn tier_count(&self) -> usize {
        self.retry.len()
    }

    /// Returns the retry topic for a 1-based tier, clamping past-the-end
    /// attempts onto the last tier (`k = min(attempt, N)`).
    ///
    /// Returns `None` when no retry tiers are configured.
    #[must_use]
    pub fn retry_topic_for_attempt(&self, attempt: u32) -> Option<&str> {
        if self.retry.is_empty() || attempt == 0 {
            return None;
        }
        let tier = usize::try_from(attempt).unwrap_or(usize::MAX);
        let index = tier.min(self.retry.len()) - 1;
        self.retry.get(index).map(String::as_str)
    }

    /// Consumer group id for the status worker.
    #[must_use]
    pub fn status_consumer_group(&self) -> String {
        format!("{}-status", self.consumer_group)
    }

    /// Consumer group id for one retry tier (1-based).
    #[must_use]
    pub fn retry_tier_consumer_group(&self, tier: usize) -> String {
        format!("{}-{tier}", self.retry_consumer_group)
    }

    /// All topics with their partition counts, for provisioning.
    #[must_use]
    pub fn provisioning_plan(&self) -> Vec<(String, i32)> {
        let partitions = TopicPartitions::from_env();
        let mut plan = vec![
            (self.dispatch.clone(), partitions.dispatch),
            (self.status.clone(), partitions.status),
        ];
        for topic in &self.retry {
            plan.push((topic.clone(), partitions.retry));
        }
        plan.push((self.deadletter.clone(), partitions.deadletter));
        plan
    }
}

/// Partition counts per topic role, from environment with deployment defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicPartitions {
    /// Partitions for the dispatch topic.
    pub dispatch: i32,
    /// Partitions for the status topic.
    pub status: i32,
    /// Partitions for each retry tier.
    pub retry: i32,
    /// Partitions for the deadletter topic.
    pub deadletter: i32,
}

impl Default for TopicPartitions {
    fn default() -> Self {
        Self {
            dispatch: DEFAULT_HOT_PARTITIONS,
            status: DEFAULT_HOT_PARTITIONS,
            retry: DEFAULT_HOT_PARTITIONS,
            deadletter: DEFAULT_DEADLETTER_PARTITIONS,
        }
    }
}

impl TopicPartitions {
    /// Reads partition counts from `DISPATCH_PARTITIONS`, `STATUS_PARTITIONS`,
    /// `RETRY_PARTITIONS`, and `DEADLETTER_PARTITIONS`, falling back to the
    /// defaults for unset or unparseable values.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dispatch: env_partitions("DISPATCH_PARTITIONS", defaults.dispatch),
            status: env_partitions("STATUS_PARTITIONS", defaults.status),
            retry: env_partitions("RETRY_PARTITIONS", defaults.retry),
            deadletter: env_partitions("DEADLETTER_PARTITIONS", defaults.deadletter),
        }
    }
}

fn env_partitions(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}
