//! sled-backed store.
//!
//! Layout:
//! - `records`: hash -> bincode(`BlockRecord`)
//! - `added`: be(time) ‖ hash -> empty, ordered by creation time
//! - `allowlist`: hash -> bincode(`AllowlistRecord`)
//! - `meta`: `checkpoint` -> be(nanos)

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use tracing::info;

use crate::crypto::Hash;
use crate::types::{from_nanos, to_nanos, AllowlistRecord, BlockRecord, BlocklistPage};

use super::{check_insertable, paginate, Mark, PersistentStore, StoreError, StoreResult};

const CHECKPOINT_KEY: &[u8] = b"checkpoint";

/// Sortable big-endian encoding of a signed timestamp
#[allow(clippy::cast_sign_loss)]
fn time_key(nanos: i64) -> [u8; 8] {
    // flip the sign bit so negative times sort before positive ones
    ((nanos as u64) ^ (1 << 63)).to_be_bytes()
}

fn index_key(record: &BlockRecord) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&time_key(to_nanos(&record.timestamp_added)));
    key[8..].copy_from_slice(record.hash.as_bytes());
    key
}

fn hash_from_index(key: &[u8]) -> StoreResult<Hash> {
    let bytes: [u8; 32] = key
        .get(8..40)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt(format!("index key of {} bytes", key.len())))?;
    Ok(Hash::from_bytes(bytes))
}

/// Store persisted in a sled database
pub struct SledStore {
    db: sled::Db,
    records: Tree,
    added: Tree,
    allowlist: Tree,
    meta: Tree,
}

impl SledStore {
    /// Open (or create) a database under `path`
    ///
    /// # Errors
    /// Returns error if sled cannot open the directory
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!(path = %path.display(), "Opened record store");
        Self::from_db(db)
    }

    /// A database deleted on drop
    ///
    /// # Errors
    /// Returns error if sled cannot create the temporary files
    pub fn temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            records: db.open_tree("records")?,
            added: db.open_tree("added")?,
            allowlist: db.open_tree("allowlist")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    /// Administrative: allowlist a hash
    ///
    /// # Errors
    /// Returns error on database or encoding failure
    pub fn add_allowlisted(&self, record: &AllowlistRecord) -> StoreResult<()> {
        self.allowlist
            .insert(record.hash.as_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    /// Administrative: drop every block record
    ///
    /// # Errors
    /// Returns error on database failure
    pub fn purge(&self) -> StoreResult<()> {
        self.records.clear()?;
        self.added.clear()?;
        Ok(())
    }

    /// Flush pending writes to disk
    ///
    /// # Errors
    /// Returns error on database failure
    pub async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn load(&self, hash: &Hash) -> StoreResult<Option<BlockRecord>> {
        self.records
            .get(hash.as_bytes())?
            .map(|bytes| bincode::deserialize(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Compare-and-swap loop applying one transition to one record
    fn update(&self, hash: &Hash, mark: Mark) -> StoreResult<()> {
        let key = hash.as_bytes();
        loop {
            let Some(current) = self.records.get(key)? else {
                return Ok(());
            };
            let mut record: BlockRecord = bincode::deserialize(&current)?;
            if !mark.apply(&mut record) {
                return Ok(());
            }
            let encoded = bincode::serialize(&record)?;
            if self
                .records
                .compare_and_swap(key, Some(current), Some(encoded))?
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn mark_all(&self, hashes: &[Hash], mark: Mark) -> StoreResult<()> {
        for hash in hashes {
            self.update(hash, mark)?;
        }
        Ok(())
    }

    /// Records in creation order starting at `since`
    fn records_from(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> impl DoubleEndedIterator<Item = StoreResult<BlockRecord>> + '_ {
        let start = since.map_or([0u8; 8], |t| time_key(to_nanos(&t)));
        self.added.range(start..).map(move |entry| {
            let (key, _) = entry?;
            let hash = hash_from_index(&key)?;
            self.load(&hash)?
                .ok_or_else(|| StoreError::Corrupt(format!("index entry without record {hash}")))
        })
    }
}

#[async_trait]
impl PersistentStore for SledStore {
    async fn create_record(&self, record: &BlockRecord) -> StoreResult<()> {
        check_insertable(record)?;
        let encoded = bincode::serialize(record)?;
        let index = index_key(record);
        let key = record.hash.as_bytes().as_slice();

        let result = (&self.records, &self.added).transaction(|(records, added)| {
            if records.get(key)?.is_some() {
                return Err(ConflictableTransactionError::Abort(()));
            }
            records.insert(key, encoded.as_slice())?;
            added.insert(index.as_slice(), sled::IVec::default())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(())) => Err(StoreError::AlreadyExists(record.hash)),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    async fn record(&self, hash: &Hash) -> StoreResult<Option<BlockRecord>> {
        self.load(hash)
    }

    async fn mark_failed(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.mark_all(hashes, Mark::Failed)
    }

    async fn mark_succeeded(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.mark_all(hashes, Mark::Succeeded)
    }

    async fn mark_invalid(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.mark_all(hashes, Mark::Invalid)
    }

    async fn pending_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Hash>> {
        let mut pending = Vec::new();
        for record in self.records_from(Some(since)) {
            let record = record?;
            if record.is_pending() {
                pending.push(record.hash);
            }
        }
        Ok(pending)
    }

    async fn failed_records(&self) -> StoreResult<Vec<Hash>> {
        let mut failed = Vec::new();
        for record in self.records_from(None) {
            let record = record?;
            if record.is_retryable() {
                failed.push(record.hash);
            }
        }
        Ok(failed)
    }

    async fn blocked_hashes(&self, offset: usize, limit: usize) -> StoreResult<BlocklistPage> {
        let mut newest_first = Vec::new();
        for record in self.records_from(None).rev() {
            let record = record?;
            if record.invalid {
                continue;
            }
            newest_first.push(record.hash);
            if newest_first.len() > offset.saturating_add(limit) {
                break;
            }
        }
        Ok(paginate(newest_first.into_iter(), offset, limit))
    }

    async fn is_allowlisted(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(self.allowlist.contains_key(hash.as_bytes())?)
    }

    async fn checkpoint(&self) -> StoreResult<DateTime<Utc>> {
        match self.meta.get(CHECKPOINT_KEY)? {
            None => Ok(DateTime::UNIX_EPOCH),
            Some(bytes) => {
                let raw = <[u8; 8]>::try_from(&bytes[..])
                    .map_err(|_| StoreError::Corrupt("checkpoint is not 8 bytes".into()))?;
                Ok(from_nanos(i64::from_be_bytes(raw)))
            }
        }
    }

    async fn set_checkpoint(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.meta
            .insert(CHECKPOINT_KEY, to_nanos(&at).to_be_bytes().to_vec())?;
        Ok(())
    }
}
