//! Content digests: the 256-bit name of every blob.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte BLAKE3-based Merkle root identifying a blob's content. Used as the store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Return the digest as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, ParseDigestError> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(ParseDigestError::Length(s.len()));
        }
        let mut out = [0u8; DIGEST_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or(ParseDigestError::InvalidHex)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| ParseDigestError::InvalidHex)?;
        }
        Ok(Digest(out))
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::from_hex(s)
    }
}

/// Failure to parse a digest from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseDigestError {
    /// Wrong number of characters.
    #[error("digest must be 64 hex characters, got {0}")]
    Length(usize),
    /// Non-hex characters.
    #[error("digest contains non-hex characters")]
    InvalidHex,
}
