//! # ringflow-engine
//!
//! Dispatch engine for large-volume outbound voice campaigns.
//!
//! This crate implements the end-to-end campaign pipeline:
//!
//! - **Scheduler**: Periodic conversion of campaign targets into dispatch
//!   work under timezone-aware business-hour gating and retry fairness
//! - **Call Worker**: Attempt execution under a distributed per-campaign
//!   concurrency semaphore
//! - **Status Worker**: Durable attempt history, call state, and counter
//!   updates with redelivery protection
//! - **Retry Worker**: Capped exponential backoff with decorrelated jitter
//!   over tiered delay queues
//!
//! ## Guarantees
//!
//! - **At-least-once**: Consumers commit offsets only after the action the
//!   message represents has been durably reflected downstream
//! - **No double-claim**: Target claims are atomic in the metadata store, so
//!   competing schedulers cannot dispatch the same target twice
//! - **Bounded concurrency**: At most `max_concurrent` slots per campaign,
//!   with TTL-bounded overshoot when a worker dies holding a slot
//!
//! ## Backends
//!
//! Every external system sits behind a narrow trait with an in-memory
//! implementation for tests and development. Production backends are
//! feature-gated: `postgres` (metadata + attempt stores), `redis` (throttle
//! store), `kafka` (message log), or `backends` for all three.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ringflow_engine::bus::memory::InMemoryBroker;
//! use ringflow_engine::config::EngineConfig;
//! use ringflow_engine::error::Result;
//! use ringflow_engine::scheduler::CampaignScheduler;
//! use ringflow_engine::store::memory::{InMemoryCallStore, InMemoryMetadataStore};
//! use ringflow_engine::topics::TopicSet;
//! use ringflow_engine::trigger::CallTrigger;
//!
//! # fn main() -> Result<()> {
//! let config = EngineConfig::default();
//! let topics = TopicSet::from_config(&config.kafka);
//! let bus = Arc::new(InMemoryBroker::new());
//! let metadata = Arc::new(InMemoryMetadataStore::new());
//! let calls = Arc::new(InMemoryCallStore::new());
//!
//! let trigger = Arc::new(CallTrigger::new(
//!     metadata.clone(),
//!     calls,
//!     bus.clone(),
//!     topics.clone(),
//!     config.retry.as_policy(),
//!     config.throttle.default_per_campaign,
//! ));
//! let _scheduler = CampaignScheduler::new(config.scheduler, metadata, bus, topics, trigger);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backoff;
pub mod bus;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod telephony;
pub mod throttle;
pub mod topics;
pub mod trigger;
pub mod window;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backoff::compute_next_attempt;
    pub use crate::bus::{BusConsumer, CallDispatcher, Message, MessageBus, StatusPublisher};
    pub use crate::config::EngineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::messages::{DispatchMessage, RetryMessage, StatusMessage};
    pub use crate::scheduler::CampaignScheduler;
    pub use crate::store::{CallStore, CampaignStore, StatsStore, TargetStore};
    pub use crate::telephony::{CallOutcome, Provider};
    pub use crate::throttle::SlotLimiter;
    pub use crate::topics::TopicSet;
    pub use crate::trigger::CallTrigger;
    pub use crate::window::within_business_hours;
}
