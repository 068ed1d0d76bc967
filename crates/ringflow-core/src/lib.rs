//! # ringflow-core
//!
//! Core abstractions for the Ringflow outbound campaign platform.
//!
//! This crate provides the foundational types shared across all Ringflow
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for campaigns, targets, calls, and attempts
//! - **Domain Model**: Campaigns, calling windows, targets, calls, and counters
//!   with validated lifecycle transitions
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging bootstrap and span constructors
//!
//! ## Crate Boundary
//!
//! `ringflow-core` is the **only** crate allowed to define shared primitives.
//! The dispatch engine, the administrative surface, and any future component
//! interact through the contracts defined here.
//!
//! ## Example
//!
//! ```rust
//! use ringflow_core::prelude::*;
//!
//! let campaign_id = CampaignId::generate();
//! let call_id = CallId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod call;
pub mod campaign;
pub mod error;
pub mod id;
pub mod observability;

pub use call::{Call, CallAttempt, CallStatus};
pub use campaign::{
    BusinessHourWindow, Campaign, CampaignStats, CampaignStatus, CampaignTarget, RetryPolicy,
    StatsDelta, TargetState,
};
pub use error::{Error, Result};
pub use id::{AttemptId, CallId, CampaignId, TargetId};

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use ringflow_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::call::{Call, CallAttempt, CallStatus};
    pub use crate::campaign::{
        BusinessHourWindow, Campaign, CampaignStats, CampaignStatus, CampaignTarget, RetryPolicy,
        StatsDelta, TargetState,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::{AttemptId, CallId, CampaignId, TargetId};
}
