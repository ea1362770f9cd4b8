//! Cryptographic primitives for blockade.
//!
//! Uses audited, production-grade crates:
//! - BLAKE3 for content hashing and salted proof-of-work digests
//! - ed25519-dalek for reporter identity keys and signatures

mod hash;
mod signature;

pub use hash::{diff, hash_data, lookup_table, Hash, Hasher};
pub use signature::{verify, Keypair, PublicKey, Signature};

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,
    /// Invalid public key format
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    /// Invalid hash format
    #[error("invalid hash: {0}")]
    InvalidHash(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
