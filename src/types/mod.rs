//! Core data types for blockade.

mod content;
mod record;

pub use content::{ContentId, ContentIdError};
pub use record::{AllowlistRecord, BlockRecord, Reporter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

/// One page of a node's blocklist, as served to peers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistPage {
    /// Hashes on this page
    #[serde(rename = "entries")]
    pub hashes: Vec<Hash>,
    /// Whether another page follows
    pub has_more: bool,
}

/// Nanoseconds since the Unix epoch, the resolution records are indexed at
pub type Timestamp = i64;

/// Convert a time to indexed nanoseconds, saturating outside ~1677..2262
#[must_use]
pub fn to_nanos(time: &DateTime<Utc>) -> Timestamp {
    time.timestamp_nanos_opt().unwrap_or_else(|| {
        if time.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

/// Convert indexed nanoseconds back to a time
#[must_use]
pub fn from_nanos(nanos: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}
