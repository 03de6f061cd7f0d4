//! HMAC-SHA256 signing keyed by the operator's signing secret.
//!
//! Ledger entries and audit bundles are authenticated with a symmetric
//! secret. The secret is never stored in configuration: it is read from an
//! environment variable or a mode-0600 secret file holding hex.

use std::fs::File;
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN_BYTES: usize = 32;

/// Length of secrets produced by [`SigningSecret::generate`].
pub const GENERATED_SECRET_LEN_BYTES: usize = 32;

/// Upper bound on the hex-encoded secret we are willing to read.
const MAX_SECRET_ENCODED_CHARS: usize = 256;

/// Errors raised while loading a secret or producing a signature.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigningError {
    /// No secret was found in any configured source.
    #[error("signing secret unavailable: {0}")]
    Unavailable(String),

    /// The secret could not be decoded.
    #[error("malformed signing secret: {0}")]
    Malformed(String),

    /// The secret is shorter than [`MIN_SECRET_LEN_BYTES`].
    #[error("signing secret too short: {len} bytes (minimum {MIN_SECRET_LEN_BYTES})")]
    TooShort {
        /// Decoded length.
        len: usize,
    },

    /// I/O failure while reading or writing a secret file.
    #[error("secret file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Secret bytes and the HMAC keyed by them. `Debug` never prints the
/// contents.
#[derive(Clone)]
pub struct SigningSecret {
    bytes: Vec<u8>,
    mac: HmacSha256,
}

impl std::fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SigningSecret").field(&"[REDACTED]").finish()
    }
}

impl SigningSecret {
    /// Wraps raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::TooShort`] for secrets under the minimum
    /// length, or [`SigningError::Malformed`] if HMAC rejects the key.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SigningError> {
        if bytes.len() < MIN_SECRET_LEN_BYTES {
            return Err(SigningError::TooShort { len: bytes.len() });
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(&bytes)
            .map_err(|e| SigningError::Malformed(e.to_string()))?;
        Ok(Self { bytes, mac })
    }

    /// Decodes a hex-encoded secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not hex, is oversized, or decodes to
    /// fewer than [`MIN_SECRET_LEN_BYTES`] bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, SigningError> {
        let encoded = encoded.trim();
        if encoded.len() > MAX_SECRET_ENCODED_CHARS {
            return Err(SigningError::Malformed(
                "encoded secret exceeds maximum length".to_string(),
            ));
        }
        let bytes = hex::decode(encoded).map_err(|e| SigningError::Malformed(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Reads a hex secret from the named environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Unavailable`] when the variable is unset or
    /// empty, or a decoding error.
    pub fn from_env(var: &str) -> Result<Self, SigningError> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Self::from_hex(&value),
            _ => Err(SigningError::Unavailable(format!(
                "environment variable {var} is not set"
            ))),
        }
    }

    /// Reads a hex secret from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, oversized, or malformed.
    pub fn from_file(path: &Path) -> Result<Self, SigningError> {
        let file = File::open(path).map_err(|e| {
            SigningError::Unavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        let mut encoded = String::new();
        file.take(MAX_SECRET_ENCODED_CHARS as u64 + 2)
            .read_to_string(&mut encoded)?;
        Self::from_hex(&encoded)
    }

    /// Generates a fresh random secret from the OS RNG.
    ///
    /// # Errors
    ///
    /// See [`SigningSecret::from_bytes`].
    pub fn generate() -> Result<Self, SigningError> {
        let mut secret = vec![0u8; GENERATED_SECRET_LEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self::from_bytes(secret)
    }

    /// Writes the secret as hex to `path` atomically, mode 0600 on unix.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the temp file cannot be created, synced, or
    /// persisted.
    pub fn write_to_file(&self, path: &Path) -> Result<(), SigningError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        #[cfg(unix)]
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        temp.write_all(hex::encode(&self.bytes).as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| SigningError::Io(e.error))?;
        Ok(())
    }
}

/// Produces and checks HMAC-SHA256 signatures.
#[derive(Debug, Clone)]
pub struct Signer {
    secret: SigningSecret,
}

impl Signer {
    /// Creates a signer over the given secret.
    #[must_use]
    pub const fn new(secret: SigningSecret) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        self.secret.mac.clone()
    }

    /// Signs `message`, returning a lowercase hex tag.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signs `hash || previous_signature` for a chained ledger entry.
    #[must_use]
    pub fn sign_chained(&self, hash: &str, previous_signature: &str) -> String {
        let mut mac = self.mac();
        mac.update(hash.as_bytes());
        mac.update(previous_signature.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a hex tag over `message` in constant time.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        constant_time_hex_eq(&self.sign(message), signature)
    }

    /// Verifies a chained ledger signature in constant time.
    #[must_use]
    pub fn verify_chained(&self, hash: &str, previous_signature: &str, signature: &str) -> bool {
        constant_time_hex_eq(&self.sign_chained(hash, previous_signature), signature)
    }
}

/// Compares two hex strings after decoding, in constant time.
///
/// Undecodable or length-mismatched inputs compare unequal.
#[must_use]
pub fn constant_time_hex_eq(expected: &str, actual: &str) -> bool {
    let (Ok(expected), Ok(actual)) = (hex::decode(expected), hex::decode(actual)) else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_signer() -> Signer {
        Signer::new(SigningSecret::from_bytes(vec![7u8; 32]).unwrap())
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = test_signer();
        let tag = signer.sign(b"message");
        assert_eq!(tag.len(), 64);
        assert!(signer.verify(b"message", &tag));
        assert!(!signer.verify(b"tampered", &tag));
    }

    #[test]
    fn test_chained_signature_depends_on_previous() {
        let signer = test_signer();
        let a = signer.sign_chained("aa", "00");
        let b = signer.sign_chained("aa", "01");
        assert_ne!(a, b);
        assert!(signer.verify_chained("aa", "00", &a));
        assert!(!signer.verify_chained("aa", "01", &a));
    }

    #[test]
    fn test_different_secrets_disagree() {
        let other = Signer::new(SigningSecret::from_bytes(vec![8u8; 32]).unwrap());
        let tag = test_signer().sign(b"message");
        assert!(!other.verify(b"message", &tag));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            SigningSecret::from_bytes(vec![1u8; 16]),
            Err(SigningError::TooShort { len: 16 })
        ));
        assert!(matches!(
            SigningSecret::from_hex("not-hex"),
            Err(SigningError::Malformed(_))
        ));
    }

    #[test]
    fn test_long_secret_signs_like_hmac_of_any_key() {
        let secret = SigningSecret::from_bytes(vec![0x5A; 200]).unwrap();
        let signer = Signer::new(secret.clone());
        let tag = signer.sign(b"message");
        assert!(signer.verify(b"message", &tag));
        // Signing does not consume or mutate the keyed state.
        assert_eq!(Signer::new(secret).sign(b"message"), tag);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let secret = SigningSecret::from_bytes(vec![0xAB; 32]).unwrap();
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("ab"));
    }

    #[test]
    fn test_secret_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("signing.key");
        let secret = SigningSecret::generate().unwrap();
        secret.write_to_file(&path).unwrap();

        let loaded = SigningSecret::from_file(&path).unwrap();
        let a = Signer::new(secret).sign(b"x");
        let b = Signer::new(loaded).sign(b"x");
        assert_eq!(a, b);

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_secret_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SigningSecret::from_file(&dir.path().join("absent.key")),
            Err(SigningError::Unavailable(_))
        ));
    }

    #[test]
    fn test_constant_time_hex_eq() {
        assert!(constant_time_hex_eq("abcd", "ABCD"));
        assert!(!constant_time_hex_eq("abcd", "abce"));
        assert!(!constant_time_hex_eq("abcd", "abcdef"));
        assert!(!constant_time_hex_eq("zz", "zz"));
    }
}
