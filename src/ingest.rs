//! Creating block records from reports.
//!
//! Trusted callers insert directly. Anonymous callers pay with a
//! proof-of-work first, and the proof's key is stored as their identity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::Hash;
use crate::pow::{PowError, PowVerifier, Proof};
use crate::store::{PersistentStore, StoreError};
use crate::types::{BlockRecord, ContentId, ContentIdError, Reporter};

/// A request to block one piece of content
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    /// Content identifier in any accepted form
    pub content_id: String,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Result of a report that was not rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new pending record was stored
    Created(Hash),
    /// The hash already had a record
    AlreadyBlocked(Hash),
}

impl IngestOutcome {
    /// The content hash either way
    #[must_use]
    pub const fn hash(&self) -> &Hash {
        match self {
            Self::Created(hash) | Self::AlreadyBlocked(hash) => hash,
        }
    }
}

/// Report intake for both trusted and anonymous callers
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn PersistentStore>,
    pow: PowVerifier,
}

impl Ingestor {
    /// Create an ingestor
    #[must_use]
    pub fn new(store: Arc<dyn PersistentStore>, pow: PowVerifier) -> Self {
        Self { store, pow }
    }

    /// Insert a report from an authenticated caller
    ///
    /// # Errors
    /// Returns error if the identifier does not parse, the hash is
    /// allowlisted, or the store fails
    pub async fn report(
        &self,
        request: &BlockRequest,
        reporter: Reporter,
    ) -> Result<IngestOutcome, IngestError> {
        let hash = ContentId::parse(&request.content_id)?.content_hash();
        if self.store.is_allowlisted(&hash).await? {
            return Err(IngestError::Allowlisted(hash));
        }

        let record = BlockRecord::new(hash, reporter, request.tags.clone());
        match self.store.create_record(&record).await {
            Ok(()) => {
                info!(hash = %hash, tags = ?record.tags, "Block record created");
                Ok(IngestOutcome::Created(hash))
            }
            Err(StoreError::AlreadyExists(_)) => {
                debug!(hash = %hash, "Hash already blocked");
                Ok(IngestOutcome::AlreadyBlocked(hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a report from an anonymous caller holding a proof-of-work
    ///
    /// Contact details in `reporter` are kept; the record is always marked
    /// unauthenticated and tied to the proof's identity key.
    ///
    /// # Errors
    /// Returns error if the proof is rejected or any `report` error occurs
    pub async fn report_with_proof(
        &self,
        request: &BlockRequest,
        proof: &Proof,
        reporter: Reporter,
    ) -> Result<IngestOutcome, IngestError> {
        self.pow.verify(proof)?;

        let reporter = Reporter {
            sub: String::new(),
            unauthenticated: true,
            identity_key: Some(proof.identity_key),
            ..reporter
        };
        self.report(request, reporter).await
    }
}

/// Ingestion errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Identifier did not parse
    #[error("invalid content identifier: {0}")]
    InvalidIdentifier(#[from] ContentIdError),
    /// Hash must never be blocked
    #[error("hash {0} is allowlisted")]
    Allowlisted(Hash),
    /// Proof-of-work rejected
    #[error("proof rejected: {0}")]
    Proof(#[from] PowError),
    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
