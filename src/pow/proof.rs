//! Proof wire format.

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Hasher, Keypair, PublicKey};

use super::PowError;

/// Salt for the hash the identity key signs
const SIGNATURE_CONTEXT: &str = "blockade 2024-03-01 proof-of-work signature";
/// Salt for the hash compared against the target
const WORK_CONTEXT: &str = "blockade 2024-03-01 proof-of-work digest";

/// Supported proof layouts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProofVersion {
    /// `version(1) ‖ nonce(8) ‖ identity_key(32)`
    V1,
}

impl ProofVersion {
    /// Wire byte
    #[must_use]
    pub const fn encode(self) -> u8 {
        match self {
            Self::V1 => 1,
        }
    }

    /// Parse a wire byte
    ///
    /// # Errors
    /// Returns `UnsupportedVersion` for anything but a known byte
    pub const fn decode(byte: u8) -> Result<Self, PowError> {
        match byte {
            1 => Ok(Self::V1),
            other => Err(PowError::UnsupportedVersion(other)),
        }
    }
}

impl Serialize for ProofVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.encode())
    }
}

impl<'de> Deserialize<'de> for ProofVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let byte = u8::deserialize(deserializer)?;
        Self::decode(byte).map_err(serde::de::Error::custom)
    }
}

/// A proof-of-work submitted with an anonymous report
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Layout version
    pub version: ProofVersion,
    /// Caller-chosen nonce
    #[serde(with = "hex_bytes")]
    pub nonce: [u8; 8],
    /// Key that signed the proof and identifies the reporter
    pub identity_key: PublicKey,
    /// Detached signature over the salted canonical bytes
    #[serde(with = "hex_vec")]
    pub signature: Vec<u8>,
}

impl Proof {
    /// Length of the canonical bytes for V1
    pub const CANONICAL_LEN: usize = 1 + 8 + PublicKey::LEN;

    /// Build and sign a proof for a given nonce
    #[must_use]
    pub fn sign(keypair: &Keypair, nonce: [u8; 8]) -> Self {
        let mut proof = Self {
            version: ProofVersion::V1,
            nonce,
            identity_key: *keypair.public_key(),
            signature: Vec::new(),
        };
        proof.signature = keypair.sign(proof.signing_hash().as_bytes()).as_bytes().to_vec();
        proof
    }

    /// `version ‖ nonce ‖ identity_key`
    #[must_use]
    pub fn canonical_bytes(&self) -> [u8; Self::CANONICAL_LEN] {
        let mut out = [0u8; Self::CANONICAL_LEN];
        out[0] = self.version.encode();
        out[1..9].copy_from_slice(&self.nonce);
        out[9..].copy_from_slice(self.identity_key.as_bytes());
        out
    }

    /// Salted hash the signature is made over
    #[must_use]
    pub fn signing_hash(&self) -> Hash {
        let mut hasher = Hasher::with_context(SIGNATURE_CONTEXT);
        hasher.update(&self.canonical_bytes());
        hasher.finalize()
    }

    /// Salted hash compared against the target
    #[must_use]
    pub fn work_hash(&self) -> Hash {
        let mut hasher = Hasher::with_context(WORK_CONTEXT);
        hasher.update(&self.canonical_bytes());
        hasher.finalize()
    }

    /// Binary form: canonical bytes followed by the signature
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::CANONICAL_LEN + self.signature.len());
        out.extend_from_slice(&self.canonical_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse the binary form
    ///
    /// # Errors
    /// Returns `UnsupportedVersion` for an unknown version byte and
    /// `Malformed` if the input is too short
    pub fn decode(bytes: &[u8]) -> Result<Self, PowError> {
        let (&version, rest) = bytes
            .split_first()
            .ok_or_else(|| PowError::Malformed("empty proof".to_string()))?;
        let version = ProofVersion::decode(version)?;

        if bytes.len() < Self::CANONICAL_LEN {
            return Err(PowError::Malformed(format!(
                "expected at least {} bytes, got {}",
                Self::CANONICAL_LEN,
                bytes.len()
            )));
        }

        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&rest[..8]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&rest[8..40]);

        Ok(Self {
            version,
            nonce,
            identity_key: PublicKey::from_bytes_unchecked(key),
            signature: rest[40..].to_vec(),
        })
    }
}

/// Search nonces until the work hash beats `target`
///
/// Starts from a random nonce so that concurrent solvers with the same key
/// do not repeat each other's work. Returns `None` after `max_attempts`.
#[must_use]
pub fn solve(keypair: &Keypair, target: &[u8; 32], max_attempts: u64) -> Option<Proof> {
    let start: u64 = rand::random();
    let mut candidate = Proof {
        version: ProofVersion::V1,
        nonce: [0u8; 8],
        identity_key: *keypair.public_key(),
        signature: Vec::new(),
    };

    for i in 0..max_attempts {
        candidate.nonce = start.wrapping_add(i).to_le_bytes();
        if super::meets_target(&candidate.work_hash(), target) {
            return Some(Proof::sign(keypair, candidate.nonce));
        }
    }
    None
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 8], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 8 bytes"))
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
