//! Test doubles shared across modules.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::crypto::{hash_data, Hash};
use crate::daemon::{DaemonError, EnforcementDaemon};
use crate::peer::{PeerClient, PeerError};
use crate::shutdown::Shutdown;
use crate::store::{Mark, MemoryStore, PersistentStore, StoreError, StoreResult};
use crate::types::{BlockRecord, BlocklistPage, Reporter};

/// Distinct non-zero hashes
pub fn hashes(n: usize) -> Vec<Hash> {
    (0..n).map(|i| hash_data(&i.to_le_bytes())).collect()
}

/// A pending record for `hash`
pub fn record(hash: Hash) -> BlockRecord {
    BlockRecord::new(hash, Reporter::default(), vec!["test".into()])
}

/// Daemon that accepts batches in memory
///
/// A batch containing any `rejected` hash fails with a content error, like
/// the real daemon's all-or-nothing bulk endpoint.
#[derive(Default)]
pub struct FakeDaemon {
    rejected: Mutex<HashSet<Hash>>,
    invalid: Mutex<HashSet<Hash>>,
    offline: AtomicBool,
    calls: Mutex<Vec<Vec<Hash>>>,
    blocklist: Mutex<Vec<Hash>>,
    trip: Mutex<Option<(usize, Arc<Shutdown>)>>,
}

impl FakeDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject(&self, hashes: &[Hash]) {
        self.rejected.lock().unwrap().extend(hashes.iter().copied());
    }

    pub fn report_invalid(&self, hashes: &[Hash]) {
        self.invalid.lock().unwrap().extend(hashes.iter().copied());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn preload(&self, hashes: &[Hash]) {
        self.blocklist.lock().unwrap().extend(hashes.iter().copied());
    }

    /// Lose every enforced hash, as after a daemon reinstall
    pub fn forget_all(&self) {
        self.blocklist.lock().unwrap().clear();
    }

    /// Trigger `shutdown` while serving call number `call` (1-based)
    pub fn shutdown_during_call(&self, call: usize, shutdown: Arc<Shutdown>) {
        *self.trip.lock().unwrap() = Some((call, shutdown));
    }

    /// Every batch submitted, in order
    pub fn calls(&self) -> Vec<Vec<Hash>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Hashes currently enforced
    pub fn enforced(&self) -> Vec<Hash> {
        self.blocklist.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnforcementDaemon for FakeDaemon {
    async fn submit_block_batch(&self, hashes: &[Hash]) -> Result<Vec<Hash>, DaemonError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(hashes.to_vec());
            calls.len()
        };
        if let Some((at, shutdown)) = self.trip.lock().unwrap().as_ref() {
            if *at == call {
                shutdown.trigger();
            }
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(DaemonError::Unreachable("connection refused".into()));
        }
        let rejected = self.rejected.lock().unwrap();
        if let Some(bad) = hashes.iter().find(|h| rejected.contains(h)) {
            return Err(DaemonError::Rejected(format!("invalid hash {bad}")));
        }
        let invalid = self.invalid.lock().unwrap();
        let mut blocklist = self.blocklist.lock().unwrap();
        let mut reported = Vec::new();
        for hash in hashes {
            if invalid.contains(hash) {
                reported.push(*hash);
            } else if !blocklist.contains(hash) {
                blocklist.push(*hash);
            }
        }
        Ok(reported)
    }

    async fn fetch_blocklist(&self) -> Result<Vec<Hash>, DaemonError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DaemonError::Unreachable("connection refused".into()));
        }
        Ok(self.enforced())
    }

    async fn is_up(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

/// Peer serving a fixed newest-first list
pub struct FakePeer {
    url: String,
    list: Mutex<Vec<Hash>>,
    failing: AtomicBool,
    requests: Mutex<Vec<(usize, usize)>>,
}

impl FakePeer {
    pub fn new(url: &str, list: Vec<Hash>) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            list: Mutex::new(list),
            failing: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Add newer entries at the front
    pub fn publish(&self, hashes: &[Hash]) {
        let mut list = self.list.lock().unwrap();
        let mut updated = hashes.to_vec();
        updated.append(&mut list);
        *list = updated;
    }

    /// `(offset, limit)` of every page request
    pub fn requests(&self) -> Vec<(usize, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerClient for FakePeer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_blocklist(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<BlocklistPage, PeerError> {
        self.requests.lock().unwrap().push((offset, limit));
        if self.failing.load(Ordering::SeqCst) {
            return Err(PeerError::Unreachable("peer offline".into()));
        }
        let list = self.list.lock().unwrap();
        Ok(crate::store::paginate(list.iter().copied(), offset, limit))
    }
}

/// `MemoryStore` that records every status write
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    marks: Mutex<Vec<(Mark, Vec<Hash>)>>,
    failing_marks: AtomicBool,
    checkpoint_writes: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn marks(&self) -> Vec<(Mark, Vec<Hash>)> {
        self.marks.lock().unwrap().clone()
    }

    pub fn marks_of(&self, kind: Mark) -> Vec<Vec<Hash>> {
        self.marks()
            .into_iter()
            .filter(|(m, _)| *m == kind)
            .map(|(_, h)| h)
            .collect()
    }

    pub fn set_failing_marks(&self, failing: bool) {
        self.failing_marks.store(failing, Ordering::SeqCst);
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    pub async fn insert_all(&self, hashes: &[Hash]) {
        for hash in hashes {
            self.inner.create_record(&record(*hash)).await.unwrap();
        }
    }

    fn log(&self, kind: Mark, hashes: &[Hash]) -> StoreResult<()> {
        self.marks.lock().unwrap().push((kind, hashes.to_vec()));
        if self.failing_marks.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for RecordingStore {
    async fn create_record(&self, record: &BlockRecord) -> StoreResult<()> {
        self.inner.create_record(record).await
    }

    async fn record(&self, hash: &Hash) -> StoreResult<Option<BlockRecord>> {
        self.inner.record(hash).await
    }

    async fn mark_failed(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.log(Mark::Failed, hashes)?;
        self.inner.mark_failed(hashes).await
    }

    async fn mark_succeeded(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.log(Mark::Succeeded, hashes)?;
        self.inner.mark_succeeded(hashes).await
    }

    async fn mark_invalid(&self, hashes: &[Hash]) -> StoreResult<()> {
        self.log(Mark::Invalid, hashes)?;
        self.inner.mark_invalid(hashes).await
    }

    async fn pending_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Hash>> {
        self.inner.pending_since(since).await
    }

    async fn failed_records(&self) -> StoreResult<Vec<Hash>> {
        self.inner.failed_records().await
    }

    async fn blocked_hashes(&self, offset: usize, limit: usize) -> StoreResult<BlocklistPage> {
        self.inner.blocked_hashes(offset, limit).await
    }

    async fn is_allowlisted(&self, hash: &Hash) -> StoreResult<bool> {
        self.inner.is_allowlisted(hash).await
    }

    async fn checkpoint(&self) -> StoreResult<DateTime<Utc>> {
        self.inner.checkpoint().await
    }

    async fn set_checkpoint(&self, at: DateTime<Utc>) -> StoreResult<()> {
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_checkpoint(at).await
    }
}

/// A request as seen by `serve_canned`
#[derive(Debug)]
pub struct CapturedRequest {
    pub method: Method,
    /// Path and query
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
struct Canned {
    status: StatusCode,
    body: String,
    captured: Arc<Mutex<Option<oneshot::Sender<CapturedRequest>>>>,
}

async fn answer(
    State(canned): State<Canned>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(tx) = canned.captured.lock().unwrap().take() {
        let target = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), ToString::to_string);
        let _ = tx.send(CapturedRequest {
            method,
            target,
            headers,
            body,
        });
    }
    (
        canned.status,
        [(header::CONTENT_TYPE, "application/json")],
        canned.body,
    )
}

/// Serve `body` with `status` on every path; the first request is captured
pub async fn serve_canned(
    status: u16,
    body: impl Into<String>,
) -> (String, oneshot::Receiver<CapturedRequest>) {
    let (tx, rx) = oneshot::channel();
    let canned = Canned {
        status: StatusCode::from_u16(status).unwrap(),
        body: body.into(),
        captured: Arc::new(Mutex::new(Some(tx))),
    };
    let app = Router::new().fallback(answer).with_state(canned);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (url, rx)
}

/// A loopback URL nothing listens on
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}
