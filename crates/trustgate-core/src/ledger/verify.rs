//! Chain verification as a lazy, restartable walk.
//!
//! [`LedgerVerifier`] yields one [`VerifiedEntry`] per ledger line that
//! passes the [`VerifyFilter`]. The chain itself is always walked over every
//! line, so a filtered view still checks each yielded entry against its true
//! predecessor; failures on lines hidden by the filter are tallied in
//! [`LedgerVerifier::failures_outside_filter`].
//!
//! Checks run in this order and the first failure is reported:
//!
//! 1. genesis position (`MissingGenesis` / `UnexpectedGenesis`)
//! 2. hash of the recomputed record (`HashMismatch`), then the stored record
//!    text (`RecordMismatch`)
//! 3. chain link to the previous signature (`ChainBreak`)
//! 4. Merkle root for stage receipts (`RootMismatch`)
//! 5. HMAC signature (`SignatureInvalid`), when a signer is supplied

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entry::{EntryKind, LedgerEntry};
use super::storage::{EntryStream, LedgerError, derive_reference};
use crate::crypto::{ContentHasher, Signer};

/// Why an entry failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum VerificationFailure {
    /// The first entry is not `genesis`.
    #[error("MissingGenesis")]
    MissingGenesis,

    /// A `genesis` entry appears after the first line.
    #[error("UnexpectedGenesis")]
    UnexpectedGenesis,

    /// The stored hash does not match the recomputed record.
    #[error("HashMismatch")]
    HashMismatch {
        /// Hash of the recomputed record.
        expected: String,
        /// Stored hash.
        actual: String,
    },

    /// The stored record text differs from the recomputed record.
    #[error("RecordMismatch")]
    RecordMismatch,

    /// `previous_signature` does not match the prior entry's signature.
    #[error("ChainBreak")]
    ChainBreak {
        /// Signature of the prior entry.
        expected: String,
        /// Stored `previous_signature`.
        actual: String,
    },

    /// The stage receipt's reference is not the Merkle root of its leaves.
    #[error("RootMismatch")]
    RootMismatch {
        /// Recomputed root.
        expected: String,
        /// Stored reference.
        actual: String,
    },

    /// The stage receipt payload cannot produce a root.
    #[error("InvalidPayload({0})")]
    InvalidPayload(String),

    /// The HMAC signature does not verify.
    #[error("SignatureInvalid")]
    SignatureInvalid,
}

impl VerificationFailure {
    /// Stable reason code printed by the CLI.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingGenesis => "MissingGenesis",
            Self::UnexpectedGenesis => "UnexpectedGenesis",
            Self::HashMismatch { .. } => "HashMismatch",
            Self::RecordMismatch => "RecordMismatch",
            Self::ChainBreak { .. } => "ChainBreak",
            Self::RootMismatch { .. } => "RootMismatch",
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::SignatureInvalid => "SignatureInvalid",
        }
    }
}

/// Result of checking one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Every check passed.
    Verified,
    /// Listing mode; no checks were run.
    Unverified,
    /// The first check that failed.
    Failed(VerificationFailure),
}

impl VerificationStatus {
    /// Returns `true` for [`VerificationStatus::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Selects which entries are yielded.
#[derive(Debug, Clone, Default)]
pub struct VerifyFilter {
    /// Only entries whose `payload.workflow_id` matches.
    pub workflow_id: Option<String>,
    /// Only these kinds (all when `None`).
    pub kinds: Option<BTreeSet<EntryKind>>,
    /// Inclusive lower bound on `timestamp`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `timestamp`.
    pub until: Option<u64>,
    /// Maximum number of yielded entries.
    pub limit: Option<usize>,
    /// Run the hash, chain, root, and signature checks.
    pub verify_signatures: bool,
}

impl VerifyFilter {
    /// A filter that yields everything and verifies it.
    #[must_use]
    pub fn verify_all() -> Self {
        Self {
            verify_signatures: true,
            ..Self::default()
        }
    }

    /// Restricts to a workflow.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Restricts to a set of kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EntryKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Restricts to `[since, until]`.
    #[must_use]
    pub const fn with_window(mut self, since: Option<u64>, until: Option<u64>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    /// Caps the number of yielded entries.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `entry` should be yielded.
    #[must_use]
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(workflow_id) = &self.workflow_id {
            if entry.workflow_id() != Some(workflow_id.as_str()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&entry.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| entry.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| entry.timestamp > until) {
            return false;
        }
        true
    }
}

/// One yielded row.
#[derive(Debug, Clone)]
pub struct VerifiedEntry {
    /// Zero-based position in the ledger.
    pub index: u64,
    /// Byte offset of the line.
    pub offset: u64,
    /// The parsed entry.
    pub entry: LedgerEntry,
    /// Outcome of the checks.
    pub status: VerificationStatus,
}

/// A resumable position: everything before `byte_offset` verified cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyCheckpoint {
    /// Number of entries covered.
    pub entries: u64,
    /// Offset just past the last covered line.
    pub byte_offset: u64,
    /// Signature of the last covered entry.
    pub last_signature: String,
}

impl VerifyCheckpoint {
    /// Default checkpoint path for a ledger file.
    #[must_use]
    pub fn path_for(ledger_path: &Path) -> PathBuf {
        ledger_path.with_extension("checkpoint.json")
    }

    /// Loads a checkpoint; `Ok(None)` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>, LedgerError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(LedgerError::Serialization),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LedgerError::Io(err)),
        }
    }

    /// Atomically writes the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or persisted.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        let bytes = serde_json::to_vec_pretty(self).map_err(LedgerError::Serialization)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| LedgerError::Io(e.error))?;
        Ok(())
    }
}

/// Lazy iterator over `(entry, status)` rows.
pub struct LedgerVerifier {
    stream: EntryStream,
    signer: Option<Signer>,
    filter: VerifyFilter,
    previous_signature: String,
    yielded: usize,
    failures: u64,
    failures_outside_filter: u64,
    clean: Option<VerifyCheckpoint>,
    finished: bool,
}

impl std::fmt::Debug for LedgerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerVerifier")
            .field("filter", &self.filter)
            .field("yielded", &self.yielded)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl LedgerVerifier {
    /// Starts a walk from the first line.
    ///
    /// Without a signer, HMAC checks are skipped; every other check still
    /// runs when `filter.verify_signatures` is set.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the ledger cannot be opened.
    pub fn new(
        path: &Path,
        signer: Option<Signer>,
        filter: VerifyFilter,
    ) -> Result<Self, LedgerError> {
        let stream = EntryStream::open(path)?;
        Ok(Self::with_stream(
            stream,
            signer,
            filter,
            ContentHasher::GENESIS_PREVIOUS_SIGNATURE.to_string(),
            VerifyCheckpoint {
                entries: 0,
                byte_offset: 0,
                last_signature: ContentHasher::GENESIS_PREVIOUS_SIGNATURE.to_string(),
            },
        ))
    }

    /// Resumes a walk after a previously saved checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CheckpointMismatch`] if the checkpoint does not
    /// land on a line boundary of this ledger.
    pub fn resume(
        path: &Path,
        signer: Option<Signer>,
        filter: VerifyFilter,
        checkpoint: VerifyCheckpoint,
    ) -> Result<Self, LedgerError> {
        if checkpoint.byte_offset > 0 {
            let mut file = File::open(path)?;
            let len = file.metadata()?.len();
            if checkpoint.byte_offset > len {
                return Err(LedgerError::CheckpointMismatch(format!(
                    "offset {} beyond ledger length {len}",
                    checkpoint.byte_offset
                )));
            }
            file.seek(SeekFrom::Start(checkpoint.byte_offset - 1))?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                return Err(LedgerError::CheckpointMismatch(format!(
                    "offset {} is not a line boundary",
                    checkpoint.byte_offset
                )));
            }
        }
        let stream = EntryStream::open_at(path, checkpoint.byte_offset, checkpoint.entries)?;
        Ok(Self::with_stream(
            stream,
            signer,
            filter,
            checkpoint.last_signature.clone(),
            checkpoint,
        ))
    }

    fn with_stream(
        stream: EntryStream,
        signer: Option<Signer>,
        filter: VerifyFilter,
        previous_signature: String,
        start: VerifyCheckpoint,
    ) -> Self {
        Self {
            stream,
            clean: filter.verify_signatures.then_some(start),
            signer,
            filter,
            previous_signature,
            yielded: 0,
            failures: 0,
            failures_outside_filter: 0,
            finished: false,
        }
    }

    /// Failures among yielded rows so far.
    #[must_use]
    pub const fn failures(&self) -> u64 {
        self.failures
    }

    /// Failures on lines the filter hid (or lines past the limit).
    #[must_use]
    pub const fn failures_outside_filter(&self) -> u64 {
        self.failures_outside_filter
    }

    /// The furthest checkpoint covering only cleanly verified entries.
    ///
    /// `None` in listing mode, where nothing is verified.
    #[must_use]
    pub fn checkpoint(&self) -> Option<&VerifyCheckpoint> {
        self.clean.as_ref()
    }

    fn check(&self, index: u64, entry: &LedgerEntry) -> VerificationStatus {
        match self.first_failure(index, entry) {
            Some(failure) => VerificationStatus::Failed(failure),
            None => VerificationStatus::Verified,
        }
    }

    fn first_failure(&self, index: u64, entry: &LedgerEntry) -> Option<VerificationFailure> {
        let op = &entry.signed_operation;

        match (index, entry.kind) {
            (0, kind) if kind != EntryKind::Genesis => {
                return Some(VerificationFailure::MissingGenesis);
            },
            (i, EntryKind::Genesis) if i > 0 => {
                return Some(VerificationFailure::UnexpectedGenesis);
            },
            _ => {},
        }

        let Ok(record) = entry.recompute_record() else {
            return Some(VerificationFailure::RecordMismatch);
        };
        let expected = ContentHasher::hash_hex(record.as_bytes());
        if expected != op.hash {
            return Some(VerificationFailure::HashMismatch {
                expected,
                actual: op.hash.clone(),
            });
        }
        if record != op.record {
            return Some(VerificationFailure::RecordMismatch);
        }

        if op.previous_signature != self.previous_signature {
            return Some(VerificationFailure::ChainBreak {
                expected: self.previous_signature.clone(),
                actual: op.previous_signature.clone(),
            });
        }

        if entry.kind == EntryKind::StageReceipt {
            match derive_reference(entry.kind, &entry.payload, None) {
                Ok(root) if root == entry.reference => {},
                Ok(root) => {
                    return Some(VerificationFailure::RootMismatch {
                        expected: root,
                        actual: entry.reference.clone(),
                    });
                },
                Err(err) => return Some(VerificationFailure::InvalidPayload(err.to_string())),
            }
        }

        if let Some(signer) = &self.signer {
            if !signer.verify_chained(&op.hash, &op.previous_signature, &op.signature) {
                return Some(VerificationFailure::SignatureInvalid);
            }
        }

        None
    }
}

impl Iterator for LedgerVerifier {
    type Item = Result<VerifiedEntry, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let (index, offset, entry) = match self.stream.next()? {
                Ok(row) => row,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                },
            };

            let status = if self.filter.verify_signatures {
                self.check(index, &entry)
            } else {
                VerificationStatus::Unverified
            };

            if let Some(clean) = &mut self.clean {
                if status == VerificationStatus::Verified && clean.entries == index {
                    clean.entries = index + 1;
                    clean.byte_offset = self.stream.offset();
                    clean.last_signature.clone_from(&entry.signed_operation.signature);
                }
            }
            self.previous_signature
                .clone_from(&entry.signed_operation.signature);

            let under_limit = self.filter.limit.is_none_or(|limit| self.yielded < limit);
            if under_limit && self.filter.matches(&entry) {
                self.yielded += 1;
                if status.is_failed() {
                    self.failures += 1;
                    tracing::warn!(
                        index,
                        kind = %entry.kind,
                        status = ?status,
                        "ledger entry failed verification"
                    );
                }
                return Some(Ok(VerifiedEntry {
                    index,
                    offset,
                    entry,
                    status,
                }));
            }
            if status.is_failed() {
                self.failures_outside_filter += 1;
                tracing::warn!(
                    index,
                    kind = %entry.kind,
                    status = ?status,
                    "ledger entry outside the filter failed verification"
                );
            }
        }
    }
}
