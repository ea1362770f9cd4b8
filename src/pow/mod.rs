//! Proof-of-work admission gate for anonymous reports.
//!
//! An anonymous reporter must find a nonce whose salted BLAKE3 digest is
//! numerically below a fixed target, and sign the proof with an Ed25519 key.
//! The key then identifies the reporter, so every record bought with the
//! same key can be found and reverted together.
//!
//! ## Verification order
//!
//! 1. Signature over the salted canonical bytes (cheap rejection of forgeries)
//! 2. Work digest compared against the target as a big-endian integer

mod proof;

pub use proof::{solve, Proof, ProofVersion};

use tracing::debug;

use crate::crypto::{verify, Hash, Signature};

/// Default difficulty: twenty leading zero bits, about a million hashes
pub const DEFAULT_TARGET: [u8; 32] = [
    0x00, 0x00, 0x0f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Proof-of-work configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowConfig {
    /// Digests must be strictly below this big-endian number
    pub target: [u8; 32],
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
        }
    }
}

/// Whether a digest beats a target, both read as big-endian integers
///
/// The digest must be strictly below the target, so a larger target is
/// easier: all-0xFF accepts every digest but itself and all-zero accepts
/// none. Byte-wise lexicographic order on equal-length arrays is big-endian
/// numeric order.
#[must_use]
pub fn meets_target(digest: &Hash, target: &[u8; 32]) -> bool {
    target > digest.as_bytes()
}

/// Stateless proof verifier
#[derive(Clone, Debug)]
pub struct PowVerifier {
    target: [u8; 32],
}

impl Default for PowVerifier {
    fn default() -> Self {
        Self::new(PowConfig::default())
    }
}

impl PowVerifier {
    /// Create a verifier for a fixed target
    #[must_use]
    pub const fn new(config: PowConfig) -> Self {
        Self {
            target: config.target,
        }
    }

    /// The target clients must beat
    #[must_use]
    pub const fn target(&self) -> &[u8; 32] {
        &self.target
    }

    /// Check a proof
    ///
    /// # Errors
    /// - `InvalidSignature` if the signature does not verify under the
    ///   proof's identity key (checked first)
    /// - `InsufficientWork` if the work digest is not below the target
    pub fn verify(&self, proof: &Proof) -> Result<(), PowError> {
        let signature =
            Signature::from_slice(&proof.signature).map_err(|_| PowError::InvalidSignature)?;
        verify(
            &proof.identity_key,
            proof.signing_hash().as_bytes(),
            &signature,
        )
        .map_err(|_| PowError::InvalidSignature)?;

        let work = proof.work_hash();
        if !meets_target(&work, &self.target) {
            debug!(identity = %proof.identity_key, work = %work, "proof-of-work below difficulty");
            return Err(PowError::InsufficientWork);
        }
        Ok(())
    }
}

/// Proof-of-work errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PowError {
    /// Unknown version byte
    #[error("unsupported proof version {0}")]
    UnsupportedVersion(u8),
    /// Bytes could not be parsed
    #[error("malformed proof: {0}")]
    Malformed(String),
    /// Signature does not verify
    #[error("invalid proof signature")]
    InvalidSignature,
    /// Digest is not below the target
    #[error("insufficient proof-of-work")]
    InsufficientWork,
}
