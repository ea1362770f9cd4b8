//! Hashing primitives using BLAKE3 for performance.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A 32-byte hash digest
///
/// Used as the content hash that keys every enforcement decision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The zero hash (never a valid content hash)
    pub const ZERO: Self = Self([0u8; 32]);

    /// Length of the hex form
    pub const HEX_LEN: usize = 64;

    /// Create a hash from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the underlying bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether every byte is zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    /// Returns error if hex string is invalid or wrong length
    pub fn from_hex(s: &str) -> Result<Self, super::CryptoError> {
        let bytes = hex::decode(s).map_err(|e| super::CryptoError::InvalidHash(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(super::CryptoError::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Hash {
    type Err = super::CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Hashes travel as hex strings on every wire we speak, so serde uses the
// textual form as well.
impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hasher for incremental hashing
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Create a new hasher
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    /// Create a hasher salted with a domain-separation context
    ///
    /// Two hashers built from different contexts never agree on an input.
    #[must_use]
    pub fn with_context(context: &str) -> Self {
        Self {
            inner: blake3::Hasher::new_derive_key(context),
        }
    }

    /// Update the hasher with data
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Finalize and get the hash
    #[must_use]
    pub fn finalize(&self) -> Hash {
        let result = self.inner.finalize();
        Hash::from_bytes(*result.as_bytes())
    }
}

/// Hash arbitrary data
#[must_use]
pub fn hash_data(data: &[u8]) -> Hash {
    let result = blake3::hash(data);
    Hash::from_bytes(*result.as_bytes())
}

/// Build a membership table from a list of hashes
#[must_use]
pub fn lookup_table<'a, I>(hashes: I) -> HashSet<Hash>
where
    I: IntoIterator<Item = &'a Hash>,
{
    hashes.into_iter().copied().collect()
}

/// Elements of `source` that appear in none of the `excluded` tables
///
/// Keeps first-occurrence order and drops duplicates.
#[must_use]
pub fn diff(source: &[Hash], excluded: &[&HashSet<Hash>]) -> Vec<Hash> {
    let mut seen = HashSet::with_capacity(source.len());
    source
        .iter()
        .filter(|h| !excluded.iter().any(|table| table.contains(h)))
        .filter(|h| seen.insert(**h))
        .copied()
        .collect()
}
