//! Blocklist reconciliation with peer nodes.
//!
//! Once per interval the syncer reads the local daemon's blocklist, pages
//! through every peer's list and hands whatever is missing locally to the
//! blocker. A peer that cannot be reached is logged and skipped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blocker::{BlockOutcome, Blocker, BlockerError};
use crate::crypto::{diff, lookup_table, Hash};
use crate::daemon::{DaemonError, EnforcementDaemon};
use crate::peer::{PeerClient, PeerError};
use crate::shutdown::ShutdownSignal;

/// Syncer configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncerConfig {
    /// Peer base URLs
    pub peers: Vec<String>,
    /// Time between cycles
    pub interval: Duration,
    /// Entries requested per page
    pub page_size: usize,
    /// Pages fetched per peer per cycle at most
    pub max_pages: usize,
    /// Cursor-bounded cycles between full rescans, 0 to never force one
    pub full_rescan_every: u32,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            interval: Duration::from_secs(3600),
            page_size: 1000,
            max_pages: 1000,
            full_rescan_every: 24,
        }
    }
}

/// State carried between cycles by the sync task
///
/// Holds the newest hash seen per peer in its last clean cycle. Cursors are
/// dropped, forcing every peer's full list to be diffed again, when the
/// local blocklist comes back smaller than the previous cycle left it or
/// after `full_rescan_every` cursor-bounded cycles.
#[derive(Clone, Debug, Default)]
pub struct SyncState {
    cursors: HashMap<String, Hash>,
    expected_local: Option<usize>,
    bounded_cycles: u32,
}

impl SyncState {
    /// Empty state: the first cycle is a full scan
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for a peer URL
    #[must_use]
    pub fn cursor(&self, url: &str) -> Option<&Hash> {
        self.cursors.get(url)
    }

    /// Decide whether this cycle rescans everything, dropping cursors if so
    fn begin_cycle(&mut self, local_len: usize, full_rescan_every: u32) -> bool {
        let shrank = self.expected_local.is_some_and(|expected| local_len < expected);
        let due = full_rescan_every > 0 && self.bounded_cycles >= full_rescan_every;
        if shrank || due || self.cursors.is_empty() {
            if shrank {
                warn!(
                    local = local_len,
                    expected = self.expected_local.unwrap_or_default(),
                    "Local blocklist shrank, rescanning peers in full"
                );
            }
            self.cursors.clear();
            self.bounded_cycles = 0;
            return true;
        }
        self.bounded_cycles += 1;
        false
    }
}

struct PeerListing {
    /// Entries newer than the cursor, newest first
    hashes: Vec<Hash>,
    /// First entry of the first page
    newest: Option<Hash>,
    /// Whether paging stopped at the cursor or the end of the list
    complete: bool,
}

/// Totals for one sync cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Peers reconciled without error
    pub peers_synced: usize,
    /// Hashes handed to the blocker
    pub submitted: usize,
    /// Blocker results across all peers
    pub outcome: BlockOutcome,
}

/// Reconciliation engine
pub struct Syncer {
    config: SyncerConfig,
    peers: Vec<Arc<dyn PeerClient>>,
    daemon: Arc<dyn EnforcementDaemon>,
    blocker: Blocker,
    signal: ShutdownSignal,
    started: Mutex<bool>,
}

impl Syncer {
    /// Create a syncer over the given peer clients
    #[must_use]
    pub fn new(
        config: SyncerConfig,
        peers: Vec<Arc<dyn PeerClient>>,
        daemon: Arc<dyn EnforcementDaemon>,
        blocker: Blocker,
        signal: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            peers,
            daemon,
            blocker,
            signal,
            started: Mutex::new(false),
        }
    }

    /// Number of configured peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Spawn the sync loop
    ///
    /// With no peers configured nothing is spawned and `Ok(None)` is
    /// returned.
    ///
    /// # Errors
    /// Returns `AlreadyStarted` on the second call
    pub fn start(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>, SyncError> {
        if self.peers.is_empty() {
            info!("No peers configured, syncer not started");
            return Ok(None);
        }

        {
            let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
            if *started {
                return Err(SyncError::AlreadyStarted);
            }
            *started = true;
        }

        let this = Arc::clone(self);
        Ok(Some(tokio::spawn(async move { this.run().await })))
    }

    async fn run(&self) {
        info!(
            peers = self.peers.len(),
            interval_secs = self.config.interval.as_secs(),
            "Sync loop started"
        );
        let mut signal = self.signal.clone();
        let mut state = SyncState::new();

        while !signal.is_triggered() {
            match self.sync_once(&mut state).await {
                Ok(report) => info!(
                    peers_synced = report.peers_synced,
                    submitted = report.submitted,
                    failed = report.outcome.failed,
                    "Sync cycle complete"
                ),
                Err(e) => warn!(error = %e, "Sync cycle failed"),
            }
            if !signal.sleep(self.config.interval).await {
                break;
            }
        }

        info!("Sync loop stopped");
    }

    /// Run one reconciliation cycle
    ///
    /// # Errors
    /// Returns error if the local blocklist cannot be read, or every peer
    /// error from the cycle composed together
    pub async fn sync_once(&self, state: &mut SyncState) -> Result<SyncReport, SyncError> {
        let local = self
            .daemon
            .fetch_blocklist()
            .await
            .map_err(SyncError::LocalBlocklist)?;
        let mut known = lookup_table(&local);
        let local_len = known.len();
        let full = state.begin_cycle(local_len, self.config.full_rescan_every);
        debug!(local = local_len, full, "Fetched local blocklist");

        let mut report = SyncReport::default();
        let mut errors = Vec::new();

        for peer in &self.peers {
            if self.signal.is_triggered() {
                break;
            }
            match self.sync_peer(peer.as_ref(), &mut known, &mut state.cursors).await {
                Ok((submitted, outcome)) => {
                    report.peers_synced += 1;
                    report.submitted += submitted;
                    report.outcome.succeeded += outcome.succeeded;
                    report.outcome.failed += outcome.failed;
                    report.outcome.invalid += outcome.invalid;
                }
                Err(e) => {
                    warn!(peer = %peer.url(), error = %e, "Peer sync failed");
                    errors.push(e);
                }
            }
        }

        state.expected_local = Some(local_len + report.outcome.succeeded);

        match SyncError::compose(errors) {
            None => Ok(report),
            Some(e) => Err(e),
        }
    }

    async fn sync_peer(
        &self,
        peer: &dyn PeerClient,
        known: &mut HashSet<Hash>,
        cursors: &mut HashMap<String, Hash>,
    ) -> Result<(usize, BlockOutcome), SyncError> {
        let url = peer.url().to_string();
        let cursor = cursors.get(&url).copied();

        let listing = self
            .fetch_listing(peer, cursor)
            .await
            .map_err(|source| SyncError::Peer {
                url: url.clone(),
                source,
            })?;

        let missing = diff(&listing.hashes, &[&*known]);
        let outcome = self
            .blocker
            .block_hashes(&missing)
            .await
            .map_err(|source| SyncError::Propagation {
                url: url.clone(),
                source,
            })?;
        known.extend(missing.iter().copied());

        info!(
            peer = %url,
            fetched = listing.hashes.len(),
            submitted = missing.len(),
            failed = outcome.failed,
            "Synced peer"
        );

        let clean = listing.complete && outcome.failed == 0 && !self.signal.is_triggered();
        if let (true, Some(newest)) = (clean, listing.newest) {
            cursors.insert(url, newest);
        }

        Ok((missing.len(), outcome))
    }

    async fn fetch_listing(
        &self,
        peer: &dyn PeerClient,
        cursor: Option<Hash>,
    ) -> Result<PeerListing, PeerError> {
        let mut listing = PeerListing {
            hashes: Vec::new(),
            newest: None,
            complete: false,
        };
        let mut offset = 0;

        for _ in 0..self.config.max_pages {
            let page = peer.fetch_blocklist(offset, self.config.page_size).await?;
            if listing.newest.is_none() {
                listing.newest = page.hashes.first().copied();
            }

            for hash in &page.hashes {
                if Some(*hash) == cursor {
                    listing.complete = true;
                    return Ok(listing);
                }
                listing.hashes.push(*hash);
            }

            if !page.has_more || page.hashes.is_empty() {
                listing.complete = true;
                return Ok(listing);
            }
            offset += page.hashes.len();
        }

        warn!(
            peer = %peer.url(),
            max_pages = self.config.max_pages,
            "Page limit reached before end of peer blocklist"
        );
        Ok(listing)
    }
}

/// Syncer errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `start` was called twice
    #[error("syncer already started")]
    AlreadyStarted,
    /// The local daemon's blocklist could not be read
    #[error("could not fetch local blocklist: {0}")]
    LocalBlocklist(#[source] DaemonError),
    /// A peer could not be read
    #[error("peer {url}: {source}")]
    Peer {
        /// Peer URL
        url: String,
        /// Underlying failure
        source: PeerError,
    },
    /// Blocking a peer's hashes failed
    #[error("blocking hashes from {url}: {source}")]
    Propagation {
        /// Peer URL
        url: String,
        /// Underlying failure
        source: BlockerError,
    },
    /// Errors from several peers
    #[error("{}", join_errors(.0))]
    Multiple(Vec<SyncError>),
}

impl SyncError {
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

fn join_errors(errors: &[SyncError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
