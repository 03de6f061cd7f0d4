//! Cryptographic primitives for the evidence ledger and audit bundles.
//!
//! - **SHA-256 hashing**: record hashes, Merkle nodes, artifact digests
//! - **HMAC-SHA256 signatures**: chained ledger signatures and audit bundle
//!   signatures, keyed by the operator's signing secret
//! - **Constant-time comparison** of signature tags
//!
//! # Hash Chain
//!
//! Each ledger entry carries `signature = HMAC(secret, hash || previous)`,
//! where `previous` is the signature of the prior entry (or
//! [`ContentHasher::GENESIS_PREVIOUS_SIGNATURE`] for genesis). Rewriting any
//! historical entry invalidates every later signature.
//!
//! # Example
//!
//! ```rust
//! use trustgate_core::crypto::{ContentHasher, Signer, SigningSecret};
//!
//! let signer = Signer::new(SigningSecret::generate()?);
//! let hash = ContentHasher::hash_hex(b"record");
//! let signature =
//!     signer.sign_chained(&hash, ContentHasher::GENESIS_PREVIOUS_SIGNATURE);
//! assert!(signer.verify_chained(
//!     &hash,
//!     ContentHasher::GENESIS_PREVIOUS_SIGNATURE,
//!     &signature
//! ));
//! # Ok::<(), trustgate_core::crypto::SigningError>(())
//! ```

mod hash;
mod sign;

pub use hash::{ContentHasher, HASH_SIZE, Hash, HashParseError, parse_hash_hex};
pub use sign::{
    GENERATED_SECRET_LEN_BYTES, MIN_SECRET_LEN_BYTES, Signer, SigningError, SigningSecret,
    constant_time_hex_eq,
};
