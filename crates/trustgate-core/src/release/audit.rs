//! Signed audit bundles.
//!
//! A bundle pins the SBOM digest, the trust summary and release metadata
//! under one checksum and an HMAC signature:
//!
//! ```text
//! checksum  = SHA-256(jcs(sbom_hash) || jcs(trust_summary) || jcs(release_metadata))
//! signature = HMAC-SHA256(secret, checksum)
//! ```
//!
//! The bundle file is the canonical (JCS) encoding of the whole bundle, so
//! verification can insist that the bytes on disk are exactly what was
//! signed.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::{ContentHasher, Signer};
use crate::ledger::{EntryKind, EvidenceLedger, LedgerEntry, LedgerError};
use crate::reward::AgentTrustRecord;

/// Errors raised while publishing or verifying a bundle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// The SBOM could not be read.
    #[error("cannot read SBOM {path}: {source}")]
    Sbom {
        /// SBOM path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A bundle file could not be read or written.
    #[error("audit bundle I/O error ({path}): {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The bundle is not valid JSON of the expected shape.
    #[error("malformed audit bundle: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The bundle bytes are not its canonical encoding.
    #[error("audit bundle is not canonically encoded")]
    NotCanonical,

    /// The checksum does not cover the bundle contents.
    #[error("checksum mismatch: expected {expected}, bundle has {actual}")]
    ChecksumMismatch {
        /// Recomputed checksum.
        expected: String,
        /// Checksum in the bundle.
        actual: String,
    },

    /// The signature does not verify under the signing secret.
    #[error("audit bundle signature invalid")]
    SignatureInvalid,

    /// The detached signature file disagrees with the bundle.
    #[error("detached signature {path} does not match the bundle")]
    DetachedSignatureMismatch {
        /// Signature file path.
        path: PathBuf,
    },

    /// The bundle could not be recorded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AuditError {
    /// Short machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Sbom { .. } => "SbomUnreadable",
            Self::Io { .. } => "AuditIo",
            Self::Serialization(_) => "MalformedBundle",
            Self::NotCanonical => "NotCanonical",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::DetachedSignatureMismatch { .. } => "DetachedSignatureMismatch",
            Self::Ledger(_) => "LedgerWriteError",
        }
    }
}

/// Audit bundle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditConfig {
    /// SBOM file whose digest is pinned in the bundle.
    pub sbom_path: PathBuf,
    /// Release version recorded in the metadata.
    pub version: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sbom_path: PathBuf::from("sbom.json"),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Release facts pinned by a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseMetadata {
    /// Release version.
    pub version: String,
    /// Released commit, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// RFC 3339 generation time.
    pub generated_at: String,
    /// Ledger length when the bundle was built.
    pub ledger_entries: u64,
    /// Ledger head signature when the bundle was built.
    pub ledger_head_signature: String,
}

/// A signed release audit bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditBundle {
    /// Hex SHA-256 of the SBOM file.
    pub sbom_hash: String,
    /// Trust records for every subject, sorted by id.
    pub trust_summary: Vec<AgentTrustRecord>,
    /// Release metadata.
    pub release_metadata: ReleaseMetadata,
    /// Hex SHA-256 over the three parts above.
    pub checksum: String,
    /// Hex HMAC-SHA256 of `checksum`.
    pub signature: String,
}

impl AuditBundle {
    /// Assembles and signs a bundle.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if a part cannot be
    /// canonicalized.
    pub fn seal(
        sbom_hash: String,
        trust_summary: Vec<AgentTrustRecord>,
        release_metadata: ReleaseMetadata,
        signer: &Signer,
    ) -> Result<Self, AuditError> {
        let checksum = bundle_checksum(&sbom_hash, &trust_summary, &release_metadata)?;
        let signature = signer.sign(checksum.as_bytes());
        Ok(Self {
            sbom_hash,
            trust_summary,
            release_metadata,
            checksum,
            signature,
        })
    }

    /// The canonical file encoding.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Serialization`] if canonicalization fails.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, AuditError> {
        serde_jcs::to_vec(self).map_err(AuditError::Serialization)
    }
}

/// Checksum over the canonical encodings of the three bundle parts.
///
/// # Errors
///
/// Returns [`AuditError::Serialization`] if a part cannot be canonicalized.
pub fn bundle_checksum(
    sbom_hash: &str,
    trust_summary: &[AgentTrustRecord],
    release_metadata: &ReleaseMetadata,
) -> Result<String, AuditError> {
    let mut buf = serde_jcs::to_vec(&sbom_hash).map_err(AuditError::Serialization)?;
    buf.extend(serde_jcs::to_vec(&trust_summary).map_err(AuditError::Serialization)?);
    buf.extend(serde_jcs::to_vec(release_metadata).map_err(AuditError::Serialization)?);
    Ok(ContentHasher::hash_hex(&buf))
}

// Exact, case-sensitive comparison: hex that differs only in case is a
// different encoding of the bundle.
fn constant_time_str_eq(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}

/// Recomputes the checksum and signature of `bundle`.
///
/// # Errors
///
/// Returns [`AuditError::ChecksumMismatch`] or
/// [`AuditError::SignatureInvalid`].
pub fn verify_audit_bundle(bundle: &AuditBundle, signer: &Signer) -> Result<(), AuditError> {
    let expected = bundle_checksum(
        &bundle.sbom_hash,
        &bundle.trust_summary,
        &bundle.release_metadata,
    )?;
    if !constant_time_str_eq(&expected, &bundle.checksum) {
        return Err(AuditError::ChecksumMismatch {
            expected,
            actual: bundle.checksum.clone(),
        });
    }
    let signature = signer.sign(expected.as_bytes());
    if !constant_time_str_eq(&signature, &bundle.signature) {
        return Err(AuditError::SignatureInvalid);
    }
    Ok(())
}

/// Parses bundle bytes, requires them to be canonical, and verifies them.
///
/// # Errors
///
/// Returns an error if the bytes do not parse, are not canonical, or fail
/// [`verify_audit_bundle`].
pub fn verify_audit_bundle_bytes(
    bytes: &[u8],
    signer: &Signer,
) -> Result<AuditBundle, AuditError> {
    let bundle: AuditBundle = serde_json::from_slice(bytes).map_err(AuditError::Serialization)?;
    if bundle.to_canonical_bytes()? != bytes {
        return Err(AuditError::NotCanonical);
    }
    verify_audit_bundle(&bundle, signer)?;
    Ok(bundle)
}

/// Path of the detached signature for `bundle_path`.
#[must_use]
pub fn signature_path(bundle_path: &Path) -> PathBuf {
    let mut path = OsString::from(bundle_path.as_os_str());
    path.push(".sig");
    PathBuf::from(path)
}

/// Verifies a bundle file and, when present, its detached signature.
///
/// # Errors
///
/// Returns an error if the file cannot be read or any check fails.
pub fn verify_audit_file(path: &Path, signer: &Signer) -> Result<AuditBundle, AuditError> {
    let bytes = fs::read(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let bundle = verify_audit_bundle_bytes(&bytes, signer)?;

    let sig_path = signature_path(path);
    match fs::read_to_string(&sig_path) {
        Ok(detached) => {
            if !constant_time_str_eq(detached.trim_end(), &bundle.signature) {
                return Err(AuditError::DetachedSignatureMismatch { path: sig_path });
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %sig_path.display(), "no detached signature next to bundle");
        },
        Err(source) => {
            return Err(AuditError::Io {
                path: sig_path,
                source,
            });
        },
    }
    Ok(bundle)
}

/// A bundle written to disk and recorded in the ledger.
#[derive(Debug, Clone)]
pub struct PublishedBundle {
    /// The bundle.
    pub bundle: AuditBundle,
    /// Bundle file.
    pub path: PathBuf,
    /// Detached signature file.
    pub signature_path: PathBuf,
    /// The `audit_bundle` ledger entry.
    pub entry: LedgerEntry,
}

#[derive(Serialize)]
struct AuditEntryPayload<'a> {
    checksum: &'a str,
    signature: &'a str,
    sbom_hash: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<&'a str>,
    generated_at: &'a str,
    bundle: String,
}

fn file_safe(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AuditError> {
    let io_err = |source: std::io::Error| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(bytes).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Removes a bundle file whose ledger entry was never written.
fn remove_unrecorded(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {},
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => tracing::warn!(
            path = %path.display(),
            error = %err,
            "failed to remove unrecorded audit bundle file"
        ),
    }
}

/// Builds, writes and records an audit bundle.
///
/// The bundle lands in `output_dir` as
/// `audit-bundle-<version>-<ledger entries>.json` with a `.sig` sidecar;
/// the ledger then receives an `audit_bundle` entry referencing the
/// checksum. If the append fails the written files are removed.
///
/// # Errors
///
/// Returns an error if the SBOM is unreadable, the files cannot be written,
/// or the ledger append fails.
pub fn publish_audit_bundle(
    ledger: &EvidenceLedger,
    trust_summary: Vec<AgentTrustRecord>,
    config: &AuditConfig,
    output_dir: &Path,
    commit: Option<&str>,
) -> Result<PublishedBundle, AuditError> {
    let sbom = fs::read(&config.sbom_path).map_err(|source| AuditError::Sbom {
        path: config.sbom_path.clone(),
        source,
    })?;
    let sbom_hash = ContentHasher::hash_hex(&sbom);

    let stats = ledger.stats()?;
    let metadata = ReleaseMetadata {
        version: config.version.clone(),
        commit: commit.map(str::to_string),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ledger_entries: stats.entry_count,
        ledger_head_signature: stats.head_signature,
    };
    let bundle = AuditBundle::seal(sbom_hash, trust_summary, metadata, ledger.signer())?;

    fs::create_dir_all(output_dir).map_err(|source| AuditError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(format!(
        "audit-bundle-{}-{}.json",
        file_safe(&config.version),
        bundle.release_metadata.ledger_entries
    ));
    let sig_path = signature_path(&path);
    write_atomic(&path, &bundle.to_canonical_bytes()?)?;
    write_atomic(&sig_path, bundle.signature.as_bytes())?;

    let payload = AuditEntryPayload {
        checksum: &bundle.checksum,
        signature: &bundle.signature,
        sbom_hash: &bundle.sbom_hash,
        version: &bundle.release_metadata.version,
        commit: bundle.release_metadata.commit.as_deref(),
        generated_at: &bundle.release_metadata.generated_at,
        bundle: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let appended = serde_json::to_value(&payload)
        .map_err(AuditError::Serialization)
        .and_then(|payload| {
            ledger
                .append(EntryKind::AuditBundle, payload)
                .map_err(AuditError::from)
        });
    let entry = match appended {
        Ok(entry) => entry,
        Err(err) => {
            remove_unrecorded(&path);
            remove_unrecorded(&sig_path);
            return Err(err);
        },
    };

    tracing::info!(
        path = %path.display(),
        checksum = %bundle.checksum,
        subjects = bundle.trust_summary.len(),
        "published audit bundle"
    );
    Ok(PublishedBundle {
        bundle,
        path,
        signature_path: sig_path,
        entry,
    })
}
