//! Strongly-typed identifiers for Ringflow entities.
//!
//! All identifiers in Ringflow are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Wire-stable**: Serialized as canonical UUID strings on every message
//!   and storage schema
//! - **Globally unique**: No coordination required for generation
//!
//! The 16 raw bytes of an ID double as the message-log partition key, so all
//! messages for one call land on one partition per topic.
//!
//! # Example
//!
//! ```rust
//! use ringflow_core::id::{CallId, CampaignId};
//!
//! let campaign = CampaignId::generate();
//! let call = CallId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: CampaignId = call;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns the 16 raw bytes, used as the message partition key.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

entity_id!(
    /// A unique identifier for an outbound call campaign.
    CampaignId,
    "campaign"
);

entity_id!(
    /// A unique identifier for a registered campaign target (phone number).
    TargetId,
    "target"
);

entity_id!(
    /// A unique identifier for an individual outbound call.
    ///
    /// The call ID is the unit of message-log partitioning: dispatch, status,
    /// and retry messages for one call all use its bytes as the key.
    CallId,
    "call"
);

entity_id!(
    /// A unique identifier for one recorded call attempt.
    AttemptId,
    "attempt"
);
