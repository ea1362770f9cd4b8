//! Content identifiers and their canonical form.
//!
//! A content identifier names a piece of content by its 32-byte root.
//! Users hand us identifiers in many shapes (bare hex, `sia://` links,
//! portal URLs with paths and query strings). All of them collapse to the
//! same root, and the enforcement hash is always recomputed from that root,
//! never from the string the user typed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{hash_data, Hash};

/// URI scheme accepted in front of a bare root
const SCHEME: &str = "sia://";

/// A canonicalized content identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// The 32-byte root
    #[must_use]
    pub const fn root(&self) -> &[u8; 32] {
        &self.0
    }

    /// The hash that enforcement decisions are keyed by
    #[must_use]
    pub fn content_hash(&self) -> Hash {
        hash_data(&self.0)
    }

    /// Parse any accepted textual form
    ///
    /// # Errors
    /// Returns `ContentIdError` if no 32-byte root can be extracted
    pub fn parse(input: &str) -> Result<Self, ContentIdError> {
        let token = canonical_token(input)?;
        if token.len() != Hash::HEX_LEN {
            return Err(ContentIdError::BadLength(token.len()));
        }

        let bytes = hex::decode(token.to_ascii_lowercase())
            .map_err(|e| ContentIdError::BadEncoding(e.to_string()))?;
        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes);

        if root == [0u8; 32] {
            return Err(ContentIdError::ZeroRoot);
        }
        Ok(Self(root))
    }
}

/// Strip scheme, host, path and query down to the identifier token
fn canonical_token(input: &str) -> Result<&str, ContentIdError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ContentIdError::Empty);
    }

    let rest = if let Some(rest) = trimmed.strip_prefix(SCHEME) {
        rest
    } else if let Some(rest) = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
    {
        // portal URL: host first, identifier is the first path segment
        rest.split_once('/').map(|(_, path)| path).ok_or(ContentIdError::Empty)?
    } else {
        trimmed
    };

    let token = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    if token.is_empty() {
        return Err(ContentIdError::Empty);
    }
    Ok(token)
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({}..)", &hex::encode(self.0)[..16])
    }
}

/// Content identifier parse errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContentIdError {
    /// Nothing to parse
    #[error("empty content identifier")]
    Empty,
    /// Token has the wrong length
    #[error("content identifier must be 64 hex characters, got {0}")]
    BadLength(usize),
    /// Token is not hex
    #[error("content identifier is not valid hex: {0}")]
    BadEncoding(String),
    /// All-zero roots name nothing
    #[error("content identifier has an all-zero root")]
    ZeroRoot,
}
