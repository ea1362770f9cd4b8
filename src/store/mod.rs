//! Persistent record store.
//!
//! Every loop in the node coordinates through this store and nothing else:
//! the scan loop reads pending records, the retry loop reads failed ones,
//! and the batch engine writes status marks back. Each mutation touches a
//! single record keyed by hash, so concurrent writers never need more than
//! a per-record conditional update.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::crypto::Hash;
use crate::types::{BlockRecord, BlocklistPage};

/// Store capability consumed by the batch engine and ingestion paths
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Insert a new pending record
    ///
    /// Fails with `AlreadyExists` if the hash is present and with
    /// `MissingHash` if the record's hash is zero.
    async fn create_record(&self, record: &BlockRecord) -> StoreResult<()>;

    /// Fetch a record by hash
    async fn record(&self, hash: &Hash) -> StoreResult<Option<BlockRecord>>;

    /// Flag records for retry (invalid records are left alone)
    async fn mark_failed(&self, hashes: &[Hash]) -> StoreResult<()>;

    /// Clear the failed flag
    async fn mark_succeeded(&self, hashes: &[Hash]) -> StoreResult<()>;

    /// Exclude records from every future batch
    async fn mark_invalid(&self, hashes: &[Hash]) -> StoreResult<()>;

    /// Pending records added at or after `since`, oldest first
    async fn pending_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Hash>>;

    /// Records flagged failed and not invalid
    async fn failed_records(&self) -> StoreResult<Vec<Hash>>;

    /// Non-invalid records, newest first, one page at a time
    async fn blocked_hashes(&self, offset: usize, limit: usize) -> StoreResult<BlocklistPage>;

    /// Whether a hash must never be blocked
    async fn is_allowlisted(&self, hash: &Hash) -> StoreResult<bool>;

    /// Last time the scan loop finished a batch (epoch when never set)
    async fn checkpoint(&self) -> StoreResult<DateTime<Utc>>;

    /// Advance the scan checkpoint
    async fn set_checkpoint(&self, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Status transitions written back by the batch engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    /// Propagation failed
    Failed,
    /// Propagation succeeded
    Succeeded,
    /// The daemon rejected the hash outright
    Invalid,
}

impl Mark {
    /// Apply the transition, returning whether anything changed
    pub fn apply(self, record: &mut BlockRecord) -> bool {
        match self {
            Self::Failed => {
                if record.invalid || record.failed {
                    return false;
                }
                record.failed = true;
            }
            Self::Succeeded => {
                if !record.failed {
                    return false;
                }
                record.failed = false;
            }
            Self::Invalid => {
                if record.invalid && !record.failed {
                    return false;
                }
                record.invalid = true;
                record.failed = false;
            }
        }
        true
    }
}

/// Reject records that could never be keyed
pub(crate) fn check_insertable(record: &BlockRecord) -> StoreResult<()> {
    if record.hash.is_zero() {
        return Err(StoreError::MissingHash);
    }
    Ok(())
}

/// Slice one page out of an already ordered listing
pub(crate) fn paginate<I>(hashes: I, offset: usize, limit: usize) -> BlocklistPage
where
    I: Iterator<Item = Hash>,
{
    let mut page: Vec<Hash> = hashes.skip(offset).take(limit.saturating_add(1)).collect();
    let has_more = page.len() > limit;
    page.truncate(limit);
    BlocklistPage {
        hashes: page,
        has_more,
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Duplicate insertion
    #[error("record {0} already exists")]
    AlreadyExists(Hash),
    /// Record hash was zero
    #[error("record hash is missing")]
    MissingHash,
    /// Underlying database failure
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    /// Record could not be encoded or decoded
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    /// An entry did not have the expected layout
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
