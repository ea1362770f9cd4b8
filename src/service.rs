//! Starts and stops every background loop of a node together.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::blocker::Blocker;
use crate::config::Config;
use crate::daemon::EnforcementDaemon;
use crate::ingest::Ingestor;
use crate::peer::PeerClient;
use crate::pow::PowVerifier;
use crate::shutdown::Shutdown;
use crate::store::PersistentStore;
use crate::syncer::{SyncError, Syncer};

/// A running node: blocker loops, syncer loop and report intake
pub struct Service {
    blocker: Blocker,
    syncer: Arc<Syncer>,
    ingestor: Ingestor,
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
}

impl Service {
    /// Wire components from configuration
    #[must_use]
    pub fn new(
        config: &Config,
        store: Arc<dyn PersistentStore>,
        daemon: Arc<dyn EnforcementDaemon>,
        peers: Vec<Arc<dyn PeerClient>>,
    ) -> Self {
        let shutdown = Shutdown::new();
        let blocker = Blocker::new(
            config.blocker.clone(),
            Arc::clone(&store),
            Arc::clone(&daemon),
            shutdown.subscribe(),
        );
        let syncer = Arc::new(Syncer::new(
            config.syncer.clone(),
            peers,
            daemon,
            blocker.clone(),
            shutdown.subscribe(),
        ));
        let ingestor = Ingestor::new(store, PowVerifier::new(config.pow.clone()));

        Self {
            blocker,
            syncer,
            ingestor,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn all loops
    ///
    /// # Errors
    /// Returns `AlreadyStarted` if called twice
    pub fn start(&mut self) -> Result<(), SyncError> {
        if !self.handles.is_empty() {
            return Err(SyncError::AlreadyStarted);
        }
        let synced = self.syncer.start()?;
        self.handles.extend(self.blocker.start());
        self.handles.extend(synced);
        info!(
            tasks = self.handles.len(),
            peers = self.syncer.peer_count(),
            "Service started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for every loop to exit
    pub async fn stop(self) {
        info!("Stopping service");
        self.shutdown.trigger();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Service stopped");
    }

    /// The batch engine, for callers that block hashes directly
    #[must_use]
    pub const fn blocker(&self) -> &Blocker {
        &self.blocker
    }

    /// Report intake
    #[must_use]
    pub const fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }
}
