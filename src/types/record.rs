//! Persisted records: block decisions and allowlist entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, PublicKey};

/// Who reported a hash
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporter {
    /// Free-form name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Any other contact detail
    pub other_contact: String,
    /// Authenticated subject, empty for anonymous reports
    pub sub: String,
    /// Set when the report came in without a login
    pub unauthenticated: bool,
    /// Identity key from the proof-of-work, for anonymous reports
    pub identity_key: Option<PublicKey>,
}

impl Reporter {
    /// A reporter with no login, identified by the key that signed its proof
    #[must_use]
    pub fn anonymous(identity_key: PublicKey) -> Self {
        Self {
            unauthenticated: true,
            identity_key: Some(identity_key),
            ..Self::default()
        }
    }
}

/// One block decision, keyed by content hash
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Content hash (unique, non-zero)
    pub hash: Hash,
    /// Who asked for the block
    pub reporter: Reporter,
    /// Free-form tags
    pub tags: Vec<String>,
    /// When the record was created
    pub timestamp_added: DateTime<Utc>,
    /// Propagation failed and should be retried
    pub failed: bool,
    /// The daemon rejected the hash; never submitted again
    pub invalid: bool,
    /// Unblocked at some point
    pub reverted: bool,
    /// Tags recorded with the unblock
    pub reverted_tags: Vec<String>,
    /// When the unblock happened
    pub timestamp_reverted: Option<DateTime<Utc>>,
}

impl BlockRecord {
    /// Create a pending record
    #[must_use]
    pub fn new(hash: Hash, reporter: Reporter, tags: Vec<String>) -> Self {
        Self::at(hash, reporter, tags, Utc::now())
    }

    /// Create a pending record with an explicit creation time
    #[must_use]
    pub fn at(
        hash: Hash,
        reporter: Reporter,
        tags: Vec<String>,
        timestamp_added: DateTime<Utc>,
    ) -> Self {
        Self {
            hash,
            reporter,
            tags,
            timestamp_added,
            failed: false,
            invalid: false,
            reverted: false,
            reverted_tags: Vec::new(),
            timestamp_reverted: None,
        }
    }

    /// Pending records are neither failed nor invalid
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        !self.failed && !self.invalid
    }

    /// Failed records that are still worth retrying
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.failed && !self.invalid
    }
}

/// A hash that must never be blocked
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistRecord {
    /// Content hash
    pub hash: Hash,
    /// Why it is allowlisted
    pub description: String,
    /// When it was added
    pub timestamp_added: DateTime<Utc>,
}
