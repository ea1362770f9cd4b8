//! # Blockade
//!
//! Propagates content block decisions to an enforcement daemon and keeps a
//! node's blocklist reconciled with its peers.
//!
//! ## Architecture
//!
//! - **Blocker**: drains pending records from the store into the daemon in
//!   adaptively sized batches, with a scan loop and a retry loop
//! - **Syncer**: pulls peer blocklists and blocks whatever is missing locally
//! - **Ingestor**: accepts trusted reports, and anonymous reports that carry
//!   a proof-of-work
//!
//! The loops share nothing but the store and stateless HTTP clients, and
//! every store write is keyed by hash, so they can run in any order.

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod blocker;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod ingest;
pub mod peer;
pub mod pow;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod syncer;
pub mod types;

#[cfg(test)]
#[allow(missing_docs)]
mod testutil;

pub use blocker::{BlockOutcome, Blocker, BlockerConfig, BlockerError};
pub use config::{Config, ConfigError};
pub use crypto::{Hash, Keypair, PublicKey};
pub use daemon::{DaemonConfig, DaemonError, EnforcementDaemon, HttpDaemon};
pub use ingest::{BlockRequest, IngestError, IngestOutcome, Ingestor};
pub use peer::{HttpPeerClient, PeerClient, PeerError};
pub use pow::{PowConfig, PowError, PowVerifier, Proof};
pub use service::Service;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use store::{MemoryStore, PersistentStore, SledStore, StoreError};
pub use syncer::{SyncError, SyncState, Syncer, SyncerConfig};
pub use types::{BlockRecord, ContentId, Reporter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
