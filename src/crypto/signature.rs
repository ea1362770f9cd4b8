//! Identity keys and detached signatures using Ed25519.
//!
//! Anonymous reporters sign their proof-of-work with an Ed25519 key, and
//! that key becomes their identity on the resulting record.

use ed25519_dalek::{Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use super::{CryptoError, CryptoResult};

/// A 64-byte Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Length in bytes
    pub const LEN: usize = 64;

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Create from a slice of unknown length
    ///
    /// # Errors
    /// Returns `InvalidSignature` if the slice is not exactly 64 bytes
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(arr))
    }

    /// Get underlying bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Length in bytes
    pub const LEN: usize = 32;

    /// Create from raw bytes
    ///
    /// # Errors
    /// Returns error if bytes don't represent a valid curve point
    pub fn from_bytes(bytes: [u8; 32]) -> CryptoResult<Self> {
        // Validate it's a valid point on the curve
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Wrap bytes without checking the curve point
    ///
    /// Verification re-checks the point, so this is safe for decoding.
    #[must_use]
    pub const fn from_bytes_unchecked(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get underlying bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    /// Returns error if hex is invalid or not a valid public key
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

        if bytes.len() != Self::LEN {
            return Err(CryptoError::InvalidPublicKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(arr)
    }

    fn to_verifying_key(self) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({}..)", &self.to_hex()[..16])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// A keypair containing both the signing key and its public half
///
/// SECURITY: This type intentionally does not implement Clone or Debug
/// to prevent accidental key leakage.
pub struct Keypair {
    secret: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Rebuild a keypair from its 32-byte secret seed
    #[must_use]
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&bytes))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let public = PublicKey::from_bytes_unchecked(secret.verifying_key().to_bytes());
        Self { secret, public }
    }

    /// Get the public key
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.secret.sign(message).to_bytes())
    }
}

/// Verify a signature against a public key and message
///
/// # Errors
/// Returns error if the key is not a curve point or the signature is invalid
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> CryptoResult<()> {
    let verifying_key = public_key.to_verifying_key()?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"test message";

        let sig = keypair.sign(message);
        assert!(verify(keypair.public_key(), message, &sig).is_ok());
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"original");

        assert!(verify(keypair.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let keypair1 = Keypair::generate();
        let keypair2 = Keypair::generate();
        let message = b"test";

        let sig = keypair1.sign(message);
        assert!(verify(keypair2.public_key(), message, &sig).is_err());
    }

    #[test]
    fn test_secret_bytes_are_deterministic() {
        let a = Keypair::from_secret_bytes([7u8; 32]);
        let b = Keypair::from_secret_bytes([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"m").as_bytes(), b.sign(b"m").as_bytes());
    }

    #[test]
    fn test_signature_from_slice_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 65]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let keypair = Keypair::generate();
        let hex_str = keypair.public_key().to_hex();
        let parsed = PublicKey::from_hex(&hex_str).unwrap();
        assert_eq!(keypair.public_key(), &parsed);
    }
}
