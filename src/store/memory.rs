//! In-memory store for tests and throwaway nodes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::crypto::Hash;
use crate::types::{AllowlistRecord, BlockRecord, BlocklistPage};

use super::{check_insertable, paginate, Mark, PersistentStore, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    records: HashMap<Hash, BlockRecord>,
    allowlist: HashMap<Hash, AllowlistRecord>,
    checkpoint: Option<DateTime<Utc>>,
}

impl Inner {
    /// Records ordered by creation time, ties broken by hash
    fn ordered(&self) -> Vec<&BlockRecord> {
        let mut records: Vec<&BlockRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.timestamp_added
                .cmp(&b.timestamp_added)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        records
    }

    fn mark(&mut self, hashes: &[Hash], mark: Mark) {
        for hash in hashes {
            if let Some(record) = self.records.get_mut(hash) {
                mark.apply(record);
            }
        }
    }
}

/// Store backed by a `HashMap`, lost on restart
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative: allowlist a hash
    pub async fn add_allowlisted(&self, record: AllowlistRecord) {
        self.inner.write().await.allowlist.insert(record.hash, record);
    }

    /// Administrative: drop every record
    pub async fn purge(&self) {
        self.inner.write().await.records.clear();
    }

    /// Number of block records
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Whether the store holds no block records
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn create_record(&self, record: &BlockRecord) -> StoreResult<()> {
        check_insertable(record)?;
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.hash) {
            return Err(StoreError::AlreadyExists(record.hash));
        }
        inner.records.insert(record.hash, record.clone());
        Ok(())
    }

    async fn record(&self, hash: &Hash) -> StoreResult<Option<BlockRecord>> {
        Ok(self.inner.read().await.records.get(hash).cloned())
    }

    async fn mark_failed(&self, hashes: &[Hash]) -> StoreResult<()> {
        if !hashes.is_empty() {
            self.inner.write().await.mark(hashes, Mark::Failed);
        }
        Ok(())
    }

    async fn mark_succeeded(&self, hashes: &[Hash]) -> StoreResult<()> {
        if !hashes.is_empty() {
            self.inner.write().await.mark(hashes, Mark::Succeeded);
        }
        Ok(())
    }

    async fn mark_invalid(&self, hashes: &[Hash]) -> StoreResult<()> {
        if !hashes.is_empty() {
            self.inner.write().await.mark(hashes, Mark::Invalid);
        }
        Ok(())
    }

    async fn pending_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Hash>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ordered()
            .into_iter()
            .filter(|r| r.timestamp_added >= since && r.is_pending())
            .map(|r| r.hash)
            .collect())
    }

    async fn failed_records(&self) -> StoreResult<Vec<Hash>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ordered()
            .into_iter()
            .filter(|r| r.is_retryable())
            .map(|r| r.hash)
            .collect())
    }

    async fn blocked_hashes(&self, offset: usize, limit: usize) -> StoreResult<BlocklistPage> {
        let inner = self.inner.read().await;
        let newest_first = inner
            .ordered()
            .into_iter()
            .rev()
            .filter(|r| !r.invalid)
            .map(|r| r.hash);
        Ok(paginate(newest_first, offset, limit))
    }

    async fn is_allowlisted(&self, hash: &Hash) -> StoreResult<bool> {
        Ok(self.inner.read().await.allowlist.contains_key(hash))
    }

    async fn checkpoint(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoint
            .unwrap_or(DateTime::UNIX_EPOCH))
    }

    async fn set_checkpoint(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.write().await.checkpoint = Some(at);
        Ok(())
    }
}
