//! Batch propagation engine.
//!
//! Pushes pending hashes to the enforcement daemon in batches and writes the
//! result of every attempt back to the store. The daemon's bulk endpoint
//! fails a whole batch when a single member is malformed, so a rejected
//! batch is retried at a geometrically smaller size until the bad hash is
//! isolated on its own.
//!
//! Two background loops drive the engine:
//! - the scan loop picks up records added since the last checkpoint;
//! - the retry loop resubmits records that previously failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::{lookup_table, Hash};
use crate::daemon::{DaemonError, EnforcementDaemon};
use crate::shutdown::ShutdownSignal;
use crate::store::{PersistentStore, StoreError};

/// Blocker configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockerConfig {
    /// Initial number of hashes per daemon call
    pub batch_size: usize,
    /// Factor a rejected batch shrinks by
    pub shrink_divisor: usize,
    /// Sleep after an empty or successful scan
    pub scan_idle: Duration,
    /// Backoff added per consecutive scan error
    pub error_step: Duration,
    /// Cap on backoff steps
    pub max_error_steps: u32,
    /// Interval between retry sweeps
    pub retry_interval: Duration,
    /// How far behind the checkpoint each scan looks
    pub back_window: TimeDelta,
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            shrink_divisor: 10,
            scan_idle: Duration::from_secs(30),
            error_step: Duration::from_secs(30),
            max_error_steps: 10,
            retry_interval: Duration::from_secs(3600),
            back_window: TimeDelta::hours(1),
        }
    }
}

impl BlockerConfig {
    /// Sleep before the next scan after `consecutive_errors` failures
    #[must_use]
    pub fn scan_backoff(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.scan_idle;
        }
        let backoff = self.error_step * consecutive_errors.min(self.max_error_steps);
        if backoff.is_zero() {
            self.scan_idle
        } else {
            backoff
        }
    }

    fn shrink(&self, batch_size: usize) -> usize {
        (batch_size / self.shrink_divisor.max(2)).max(1)
    }
}

/// Per-hash results of one `block_hashes` call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Enforced by the daemon
    pub succeeded: usize,
    /// Rejected on their own; eligible for retry
    pub failed: usize,
    /// Reported structurally invalid; never retried
    pub invalid: usize,
}

#[derive(Default)]
struct Ledger {
    succeeded: Vec<Hash>,
    failed: Vec<Hash>,
    invalid: Vec<Hash>,
}

impl Ledger {
    fn accept(&mut self, batch: &[Hash], reported_invalid: &[Hash]) {
        if reported_invalid.is_empty() {
            self.succeeded.extend_from_slice(batch);
            return;
        }
        let invalid = lookup_table(reported_invalid);
        for hash in batch {
            if invalid.contains(hash) {
                self.invalid.push(*hash);
            } else {
                self.succeeded.push(*hash);
            }
        }
    }

    fn outcome(&self) -> BlockOutcome {
        BlockOutcome {
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
            invalid: self.invalid.len(),
        }
    }
}

/// Batch propagation engine
#[derive(Clone)]
pub struct Blocker {
    config: BlockerConfig,
    store: Arc<dyn PersistentStore>,
    daemon: Arc<dyn EnforcementDaemon>,
    signal: ShutdownSignal,
}

impl Blocker {
    /// Create a blocker
    #[must_use]
    pub fn new(
        config: BlockerConfig,
        store: Arc<dyn PersistentStore>,
        daemon: Arc<dyn EnforcementDaemon>,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            store,
            daemon,
            signal,
        }
    }

    /// Propagate `hashes` to the daemon and record every result
    ///
    /// Results gathered before an abort or cancellation are still written
    /// to the store; write failures are returned together with the
    /// propagation error.
    ///
    /// # Errors
    /// Returns error if the daemon is unreachable or a store write fails
    pub async fn block_hashes(&self, hashes: &[Hash]) -> Result<BlockOutcome, BlockerError> {
        if hashes.is_empty() {
            return Ok(BlockOutcome::default());
        }

        let mut ledger = Ledger::default();
        let propagated = self.propagate(hashes, &mut ledger).await;

        let mut errors = Vec::new();
        if let Err(e) = propagated {
            errors.push(e);
        }
        errors.extend(self.write_back(&ledger).await);

        let outcome = ledger.outcome();
        match BlockerError::compose(errors) {
            None => {
                debug!(
                    total = hashes.len(),
                    succeeded = outcome.succeeded,
                    failed = outcome.failed,
                    invalid = outcome.invalid,
                    "Blocked hashes"
                );
                Ok(outcome)
            }
            Some(e) => {
                warn!(
                    total = hashes.len(),
                    succeeded = outcome.succeeded,
                    failed = outcome.failed,
                    invalid = outcome.invalid,
                    error = %e,
                    "Blocking stopped early"
                );
                Err(e)
            }
        }
    }

    async fn propagate(&self, hashes: &[Hash], ledger: &mut Ledger) -> Result<(), BlockerError> {
        let mut batch_size = self.config.batch_size;
        let mut start = 0;

        while start < hashes.len() && !self.signal.is_triggered() {
            if batch_size == 0 {
                warn!("Batch size is zero, nothing will be submitted");
                break;
            }

            let end = start.saturating_add(batch_size).min(hashes.len());
            let batch = &hashes[start..end];

            match self.daemon.submit_block_batch(batch).await {
                Ok(reported_invalid) => ledger.accept(batch, &reported_invalid),
                Err(e) if !e.is_content_error() => return Err(e.into()),
                Err(e) if batch_size > 1 => {
                    batch_size = self.config.shrink(batch_size);
                    debug!(start, batch_size, error = %e, "Batch rejected, shrinking");
                    continue;
                }
                Err(e) => {
                    if batch.len() != 1 {
                        return Err(BlockerError::BatchInvariant(batch.len()));
                    }
                    warn!(hash = %batch[0], error = %e, "Daemon rejected hash");
                    ledger.failed.push(batch[0]);
                }
            }

            start = end;
        }

        Ok(())
    }

    async fn write_back(&self, ledger: &Ledger) -> Vec<BlockerError> {
        let mut errors = Vec::new();
        if !ledger.succeeded.is_empty() {
            if let Err(e) = self.store.mark_succeeded(&ledger.succeeded).await {
                errors.push(e.into());
            }
        }
        if !ledger.failed.is_empty() {
            if let Err(e) = self.store.mark_failed(&ledger.failed).await {
                errors.push(e.into());
            }
        }
        if !ledger.invalid.is_empty() {
            if let Err(e) = self.store.mark_invalid(&ledger.invalid).await {
                errors.push(e.into());
            }
        }
        errors
    }

    /// Scan for records added since the checkpoint and block them
    ///
    /// Returns `None` for an empty cycle, which leaves the checkpoint alone.
    ///
    /// # Errors
    /// Returns error if the store or the daemon fails
    pub async fn scan_once(&self) -> Result<Option<BlockOutcome>, BlockerError> {
        let now = Utc::now();
        let checkpoint = self.store.checkpoint().await?;
        let since = checkpoint
            .checked_sub_signed(self.config.back_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let pending = self.store.pending_since(since).await?;
        if pending.is_empty() {
            debug!(since = %since, "No pending records");
            return Ok(None);
        }

        let outcome = self.block_hashes(&pending).await?;
        if self.signal.is_triggered() {
            // cancelled mid-run: the unprocessed tail must stay inside the window
            return Ok(Some(outcome));
        }
        self.store.set_checkpoint(now).await?;

        info!(
            pending = pending.len(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            invalid = outcome.invalid,
            "Scan cycle complete"
        );
        Ok(Some(outcome))
    }

    /// Resubmit every failed record
    ///
    /// # Errors
    /// Returns error if the store or the daemon fails
    pub async fn retry_once(&self) -> Result<Option<BlockOutcome>, BlockerError> {
        let failed = self.store.failed_records().await?;
        if failed.is_empty() {
            return Ok(None);
        }

        let outcome = self.block_hashes(&failed).await?;
        info!(
            retried = failed.len(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            invalid = outcome.invalid,
            "Retry cycle complete"
        );
        Ok(Some(outcome))
    }

    /// Spawn the scan and retry loops
    #[must_use]
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let scan = tokio::spawn(self.clone().run_scan_loop());
        let retry = tokio::spawn(self.clone().run_retry_loop());
        vec![scan, retry]
    }

    async fn run_scan_loop(mut self) {
        info!(
            batch_size = self.config.batch_size,
            idle_secs = self.config.scan_idle.as_secs(),
            "Scan loop started"
        );
        let mut consecutive_errors: u32 = 0;

        while !self.signal.is_triggered() {
            match self.scan_once().await {
                Ok(_) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(error = %e, consecutive_errors, "Scan cycle failed");
                }
            }

            let pause = self.config.scan_backoff(consecutive_errors);
            if !self.signal.sleep(pause).await {
                break;
            }
        }

        info!("Scan loop stopped");
    }

    async fn run_retry_loop(mut self) {
        info!(
            interval_secs = self.config.retry_interval.as_secs(),
            "Retry loop started"
        );

        while !self.signal.is_triggered() {
            if let Err(e) = self.retry_once().await {
                warn!(error = %e, "Retry cycle failed");
            }
            if !self.signal.sleep(self.config.retry_interval).await {
                break;
            }
        }

        info!("Retry loop stopped");
    }
}

/// Blocker errors
#[derive(Debug, thiserror::Error)]
pub enum BlockerError {
    /// Daemon could not be reached
    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),
    /// Store read or write failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A batch larger than one hash failed at batch size one
    #[error("batch of {0} hashes failed at batch size one")]
    BatchInvariant(usize),
    /// Several of the above
    #[error("{}", join_errors(.0))]
    Multiple(Vec<BlockerError>),
}

impl BlockerError {
    /// Fold collected errors into one, `None` if there were none
    #[must_use]
    pub fn compose(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[BlockerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use crate::store::Mark;
    use crate::testutil::{hashes, record, FakeDaemon, RecordingStore};
    use tokio_test::{assert_err, assert_ok};

    fn blocker(store: &Arc<RecordingStore>, daemon: &Arc<FakeDaemon>) -> Blocker {
        Blocker::new(
            BlockerConfig::default(),
            store.clone(),
            daemon.clone(),
            ShutdownSignal::never(),
        )
    }

    #[test]
    fn test_scan_backoff() {
        let config = BlockerConfig::default();
        assert_eq!(config.scan_backoff(0), Duration::from_secs(30));
        assert_eq!(config.scan_backoff(1), Duration::from_secs(30));
        assert_eq!(config.scan_backoff(3), Duration::from_secs(90));
        assert_eq!(config.scan_backoff(10), Duration::from_secs(300));
        assert_eq!(config.scan_backoff(u32::MAX), Duration::from_secs(300));

        let no_step = BlockerConfig {
            error_step: Duration::ZERO,
            ..BlockerConfig::default()
        };
        assert_eq!(no_step.scan_backoff(4), no_step.scan_idle);
    }

    #[test]
    fn test_compose() {
        assert!(BlockerError::compose(Vec::new()).is_none());
        let single = BlockerError::compose(vec![BlockerError::BatchInvariant(3)]);
        assert!(matches!(single, Some(BlockerError::BatchInvariant(3))));

        let many = BlockerError::compose(vec![
            BlockerError::BatchInvariant(3),
            StoreError::MissingHash.into(),
        ])
        .unwrap();
        assert!(matches!(many, BlockerError::Multiple(ref v) if v.len() == 2));
        assert_eq!(
            many.to_string(),
            "batch of 3 hashes failed at batch size one; store error: record hash is missing"
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let outcome = assert_ok!(blocker(&store, &daemon).block_hashes(&[]).await);
        assert_eq!(outcome, BlockOutcome::default());
        assert_eq!(daemon.call_count(), 0);
        assert!(store.marks().is_empty());
    }

    #[tokio::test]
    async fn test_single_bad_hash_of_sixteen() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(16);
        store.insert_all(&all).await;
        let bad = all[9];
        daemon.reject(&[bad]);

        let outcome = assert_ok!(blocker(&store, &daemon).block_hashes(&all).await);
        assert_eq!(
            outcome,
            BlockOutcome {
                succeeded: 15,
                failed: 1,
                invalid: 0
            }
        );

        let calls = daemon.calls();
        assert_eq!(calls.len(), 18);
        assert_eq!(calls[0], all);
        assert_eq!(calls[1], all[..10]);
        for (i, call) in calls[2..].iter().enumerate() {
            assert_eq!(call, &vec![all[i]]);
        }

        assert_eq!(store.marks_of(Mark::Failed), vec![vec![bad]]);
        let succeeded = store.marks_of(Mark::Succeeded);
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].len(), 15);
        assert!(!succeeded[0].contains(&bad));
        assert!(store.marks_of(Mark::Invalid).is_empty());

        assert!(store.record(&bad).await.unwrap().unwrap().failed);
        assert_eq!(store.failed_records().await.unwrap(), vec![bad]);
    }

    #[tokio::test]
    async fn test_shrink_converges_on_large_input() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(250);
        let bad = all[137];
        daemon.reject(&[bad]);

        let outcome = assert_ok!(blocker(&store, &daemon).block_hashes(&all).await);
        assert_eq!(outcome.succeeded, 249);
        assert_eq!(outcome.failed, 1);

        // 100 ok, 100 rejected, 10 shrink, 1 shrink, then singles for the rest
        let calls = daemon.calls();
        assert_eq!(calls[0].len(), 100);
        assert_eq!(calls[1].len(), 100);
        assert_eq!(calls[2].len(), 10);
        assert_eq!(calls[3].len(), 10);
        assert_eq!(calls[4].len(), 10);
        assert_eq!(calls[5].len(), 10);
        assert!(calls[6..].iter().all(|c| c.len() == 1));
        assert_eq!(daemon.enforced().len(), 249);
    }

    #[tokio::test]
    async fn test_transport_error_aborts_but_records_progress() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(5);
        store.insert_all(&all).await;
        daemon.set_offline(true);

        let err = assert_err!(blocker(&store, &daemon).block_hashes(&all).await);
        assert!(matches!(err, BlockerError::Daemon(DaemonError::Unreachable(_))));
        assert_eq!(daemon.call_count(), 1);
        assert!(store.marks().is_empty());
        assert!(store.failed_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_after_progress() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(3);
        daemon.reject(&[all[1]]);
        let blocker = Blocker::new(
            BlockerConfig {
                batch_size: 1,
                ..BlockerConfig::default()
            },
            store.clone(),
            daemon.clone(),
            ShutdownSignal::never(),
        );

        // first single succeeds, second is rejected, then the daemon drops
        let first = blocker.block_hashes(&all[..2]).await.unwrap();
        assert_eq!(first.succeeded, 1);
        daemon.set_offline(true);
        assert!(blocker.block_hashes(&all[2..]).await.is_err());
        assert_eq!(store.marks_of(Mark::Succeeded), vec![vec![all[0]]]);
        assert_eq!(store.marks_of(Mark::Failed), vec![vec![all[1]]]);
    }

    #[tokio::test]
    async fn test_reported_invalid_hashes_are_marked_invalid() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(4);
        store.insert_all(&all).await;
        daemon.report_invalid(&[all[2]]);

        let outcome = blocker(&store, &daemon).block_hashes(&all).await.unwrap();
        assert_eq!(outcome.succeeded, 3);
        assert_eq!(outcome.invalid, 1);
        assert_eq!(store.marks_of(Mark::Invalid), vec![vec![all[2]]]);

        let r = store.record(&all[2]).await.unwrap().unwrap();
        assert!(r.invalid);
        assert!(!r.failed);
        assert!(store.failed_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_error_composed() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(3);
        daemon.reject(&[all[0]]);
        store.set_failing_marks(true);

        let err = blocker(&store, &daemon).block_hashes(&all).await.unwrap_err();
        // succeeded and failed writes were both attempted
        assert!(matches!(err, BlockerError::Multiple(ref v) if v.len() == 2));
        assert_eq!(store.marks().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_batch_size_guard() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let blocker = Blocker::new(
            BlockerConfig {
                batch_size: 0,
                ..BlockerConfig::default()
            },
            store.clone(),
            daemon.clone(),
            ShutdownSignal::never(),
        );
        let outcome = blocker.block_hashes(&hashes(3)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::default());
        assert_eq!(daemon.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let blocker = Blocker::new(
            BlockerConfig::default(),
            store.clone(),
            daemon.clone(),
            shutdown.subscribe(),
        );
        let outcome = blocker.block_hashes(&hashes(3)).await.unwrap();
        assert_eq!(outcome, BlockOutcome::default());
        assert_eq!(daemon.call_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_advances_checkpoint() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(3);
        store.insert_all(&all).await;
        daemon.reject(&[all[1]]);
        let blocker = blocker(&store, &daemon);

        let before = Utc::now();
        let outcome = blocker.scan_once().await.unwrap().unwrap();
        assert_eq!(outcome.failed, 1);
        let checkpoint = store.checkpoint().await.unwrap();
        assert!(checkpoint >= before);
        assert!(checkpoint <= Utc::now());

        // the failed record is the retry loop's job, not the next scan's
        let calls = daemon.call_count();
        assert!(blocker.scan_once().await.unwrap().is_some());
        assert_eq!(daemon.calls()[calls..].concat().len(), 2);
        assert!(!daemon.calls()[calls..].concat().contains(&all[1]));
    }

    #[tokio::test]
    async fn test_empty_scan_leaves_checkpoint() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        assert!(blocker(&store, &daemon).scan_once().await.unwrap().is_none());
        assert_eq!(store.checkpoint_writes(), 0);
        assert_eq!(store.checkpoint().await.unwrap(), DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_scan_cancelled_mid_batch_leaves_checkpoint() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        store.insert_all(&hashes(3)).await;
        let shutdown = Arc::new(Shutdown::new());
        daemon.shutdown_during_call(1, Arc::clone(&shutdown));
        let blocker = Blocker::new(
            BlockerConfig {
                batch_size: 1,
                ..BlockerConfig::default()
            },
            store.clone(),
            daemon.clone(),
            shutdown.subscribe(),
        );

        let outcome = blocker.scan_once().await.unwrap().unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(daemon.call_count(), 1);
        assert_eq!(store.checkpoint_writes(), 0);
        assert_eq!(store.checkpoint().await.unwrap(), DateTime::UNIX_EPOCH);
        let pending = store.pending_since(DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_error_leaves_checkpoint() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        store.insert_all(&hashes(2)).await;
        daemon.set_offline(true);

        assert!(blocker(&store, &daemon).scan_once().await.is_err());
        assert_eq!(store.checkpoint_writes(), 0);
    }

    #[tokio::test]
    async fn test_scan_window_excludes_old_records() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let checkpoint = Utc::now();
        store.set_checkpoint(checkpoint).await.unwrap();

        let edge = hashes(2);
        let mut inside = record(edge[0]);
        inside.timestamp_added = checkpoint - TimeDelta::hours(1);
        let mut outside = record(edge[1]);
        outside.timestamp_added = checkpoint - TimeDelta::hours(1) - TimeDelta::nanoseconds(1);
        store.create_record(&inside).await.unwrap();
        store.create_record(&outside).await.unwrap();

        blocker(&store, &daemon).scan_once().await.unwrap();
        assert_eq!(daemon.calls(), vec![vec![edge[0]]]);
    }

    #[tokio::test]
    async fn test_retry_leaves_checkpoint() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(2);
        store.insert_all(&all).await;
        store.mark_failed(&all).await.unwrap();

        let outcome = blocker(&store, &daemon).retry_once().await.unwrap().unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert!(store.failed_records().await.unwrap().is_empty());
        assert_eq!(store.checkpoint_writes(), 0);
    }

    #[tokio::test]
    async fn test_loops_exit_on_shutdown() {
        let store = RecordingStore::new();
        let daemon = FakeDaemon::new();
        let all = hashes(4);
        store.insert_all(&all).await;
        let shutdown = Shutdown::new();
        let blocker = Blocker::new(
            BlockerConfig::default(),
            store.clone(),
            daemon.clone(),
            shutdown.subscribe(),
        );

        let handles = blocker.start();
        // first scan runs straight away
        for _ in 0..100 {
            if daemon.enforced().len() == all.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(daemon.enforced().len(), all.len());

        shutdown.trigger();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop should stop promptly")
                .unwrap();
        }
    }
}
