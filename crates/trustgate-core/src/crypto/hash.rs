//! SHA-256 hashing primitives for ledger records and evidence digests.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a SHA-256 digest in bytes.
pub const HASH_SIZE: usize = 32;

/// Type alias for a 32-byte digest.
pub type Hash = [u8; HASH_SIZE];

/// Errors that can occur when decoding a hex-encoded digest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashParseError {
    /// The input is not valid hex.
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),

    /// The decoded digest has the wrong length.
    #[error("digest has {actual} bytes, expected {HASH_SIZE}")]
    WrongLength {
        /// The decoded length.
        actual: usize,
    },
}

/// Hasher for ledger records and content digests.
pub struct ContentHasher;

impl ContentHasher {
    /// Previous-signature value carried by the genesis entry.
    pub const GENESIS_PREVIOUS_SIGNATURE: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";

    /// Hashes raw content.
    #[must_use]
    pub fn hash(content: &[u8]) -> Hash {
        Sha256::digest(content).into()
    }

    /// Hashes raw content and returns the lowercase hex digest.
    #[must_use]
    pub fn hash_hex(content: &[u8]) -> String {
        hex::encode(Self::hash(content))
    }

    /// Hashes the concatenation `left || right`.
    ///
    /// Used for interior Merkle nodes.
    #[must_use]
    pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}

/// Decodes a hex digest into a fixed-size [`Hash`].
///
/// # Errors
///
/// Returns an error if the input is not hex or is not exactly
/// [`HASH_SIZE`] bytes long.
pub fn parse_hash_hex(value: &str) -> Result<Hash, HashParseError> {
    let bytes = hex::decode(value).map_err(|e| HashParseError::InvalidHex(e.to_string()))?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| HashParseError::WrongLength { actual })
}
