//! JSON Lines ledger storage.
//!
//! The primary file is authoritative. Every append also writes the same line
//! to `mirrors/<kind>.jsonl` beside it; mirrors exist for fast per-kind
//! diffing and are never consulted for verification.
//!
//! # Single Writer
//!
//! [`EvidenceLedger`] owns the only write handle. Appends are serialized by
//! an in-process mutex, and an exclusive advisory lock on `ledger.lock` is
//! held for the ledger's lifetime so a second process cannot open a writer
//! on the same file. Readers ([`EntryStream`]) never lock: entries are only
//! appended, each line is written with one `write_all` and flushed with
//! `sync_data`, and an unterminated final line is ignored.
//!
//! # Fail-Closed Appends
//!
//! If writing either the primary line or the mirror line fails, both files
//! are truncated back to their pre-append lengths and the append returns
//! [`LedgerError::Write`]. A half-written entry is never observable to a
//! subsequent open.

// Line counts and offsets fit in u64 on every supported target.
#![allow(clippy::cast_possible_truncation)]

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde_json::{Value, json};
use thiserror::Error;

use super::entry::{EntryKind, LEDGER_SCHEMA, LedgerEntry, SignedOperation, canonical_record};
use super::merkle::{MerkleError, StageLeaf, stage_root_hex};
use crate::crypto::{ContentHasher, Signer};

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Writing an entry failed; nothing was persisted.
    #[error("ledger write failed ({path}): {source}")]
    Write {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O error (open, read, lock).
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the writer lock.
    #[error("ledger is locked by another writer ({})", .0.display())]
    Locked(PathBuf),

    /// A complete line in the middle of the file failed to parse.
    #[error("corrupt ledger entry at line {line}: {reason}")]
    CorruptLedger {
        /// 1-based line number.
        line: u64,
        /// Parse failure.
        reason: String,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Unrecognized entry kind name.
    #[error("unknown entry kind: {0}")]
    UnknownKind(String),

    /// The payload does not satisfy the kind's requirements.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Entry kind.
        kind: EntryKind,
        /// What was wrong.
        reason: String,
    },

    /// Callers may not append a second genesis entry.
    #[error("genesis entry already present")]
    GenesisAlreadyPresent,

    /// A verification checkpoint does not fit the ledger.
    #[error("verification checkpoint does not match ledger: {0}")]
    CheckpointMismatch(String),

    /// A thread panicked while holding the writer.
    #[error("ledger writer lock poisoned")]
    WriterPoisoned,
}

impl From<MerkleError> for LedgerError {
    fn from(err: MerkleError) -> Self {
        Self::InvalidPayload {
            kind: EntryKind::StageReceipt,
            reason: err.to_string(),
        }
    }
}

/// Summary statistics over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Total number of entries, genesis included.
    pub entry_count: u64,
    /// Entries per kind.
    pub per_kind: BTreeMap<EntryKind, u64>,
    /// Signature of the last entry.
    pub head_signature: String,
    /// Timestamp of the last entry.
    pub head_timestamp: u64,
    /// Primary file size in bytes.
    pub size_bytes: u64,
}

/// Payload of a `stage_receipt` entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StageReceipt {
    /// Workflow the stage belongs to.
    pub workflow_id: String,
    /// Stage name.
    pub stage: String,
    /// Ordered task leaves.
    pub leaves: Vec<StageLeaf>,
}

/// Returns the current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Computes the reference an entry of `kind` must carry.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidPayload`] when a kind-specific field is
/// missing or malformed.
pub fn derive_reference(
    kind: EntryKind,
    payload: &Value,
    supplied: Option<&str>,
) -> Result<String, LedgerError> {
    let required_str = |field: &str| {
        payload
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LedgerError::InvalidPayload {
                kind,
                reason: format!("missing string field '{field}'"),
            })
    };
    match kind {
        EntryKind::StageReceipt => {
            let leaves: Vec<StageLeaf> = payload
                .get("leaves")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| LedgerError::InvalidPayload {
                    kind,
                    reason: e.to_string(),
                })?
                .ok_or_else(|| LedgerError::InvalidPayload {
                    kind,
                    reason: "missing 'leaves' array".to_string(),
                })?;
            Ok(stage_root_hex(&leaves)?)
        },
        EntryKind::Approval if payload.get("diff_artifact_hash").is_some() => {
            required_str("diff_artifact_hash")
        },
        EntryKind::AuditBundle => required_str("checksum"),
        _ => Ok(supplied.unwrap_or_default().to_string()),
    }
}

struct WriterState {
    file: File,
    len: u64,
    entry_count: u64,
    head_signature: String,
    head_timestamp: u64,
    mirrors: HashMap<EntryKind, File>,
}

/// The append-only evidence ledger.
pub struct EvidenceLedger {
    path: PathBuf,
    mirror_dir: PathBuf,
    signer: Signer,
    writer: Mutex<WriterState>,
    // Held for the lifetime of the writer; dropping releases the flock.
    _lock: File,
}

impl std::fmt::Debug for EvidenceLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceLedger")
            .field("path", &self.path)
            .field("mirror_dir", &self.mirror_dir)
            .finish_non_exhaustive()
    }
}

impl EvidenceLedger {
    /// Opens or creates the ledger at `path`.
    ///
    /// A missing or empty ledger is initialized with a `genesis` entry. An
    /// unterminated final line (crash mid-append) is truncated. A complete
    /// line that does not parse fails closed wherever it sits, and the file
    /// is left untouched for inspection.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Locked`] if another writer holds the lock,
    /// [`LedgerError::CorruptLedger`] for a malformed complete line, or an I/O
    /// error.
    pub fn open(path: impl AsRef<Path>, signer: Signer) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        fs::create_dir_all(&dir)?;
        let mirror_dir = dir.join("mirrors");
        fs::create_dir_all(&mirror_dir)?;

        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| LedgerError::Locked(lock_path.clone()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let recovered = recover(&mut file, &path)?;

        let ledger = Self {
            path,
            mirror_dir,
            signer,
            writer: Mutex::new(WriterState {
                file,
                len: recovered.valid_len,
                entry_count: recovered.entry_count,
                head_signature: recovered.head_signature,
                head_timestamp: recovered.head_timestamp,
                mirrors: HashMap::new(),
            }),
            _lock: lock,
        };

        if recovered.entry_count == 0 {
            let payload = json!({ "schema": LEDGER_SCHEMA });
            ledger.append_locked(EntryKind::Genesis, payload, None, true)?;
            tracing::info!(path = %ledger.path.display(), "initialized evidence ledger");
        }

        Ok(ledger)
    }

    /// Path of the primary ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the per-kind mirror logs.
    #[must_use]
    pub fn mirror_dir(&self) -> &Path {
        &self.mirror_dir
    }

    /// Path of the mirror log for `kind`.
    #[must_use]
    pub fn mirror_path(&self, kind: EntryKind) -> PathBuf {
        self.mirror_dir.join(format!("{}.jsonl", kind.as_str()))
    }

    /// The signer used for new entries (and for verification).
    #[must_use]
    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Appends an entry, deriving its reference from the payload.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Write`] if nothing could be persisted, or
    /// [`LedgerError::InvalidPayload`] for malformed kind-specific payloads.
    pub fn append(&self, kind: EntryKind, payload: Value) -> Result<LedgerEntry, LedgerError> {
        self.append_with_reference(kind, payload, None)
    }

    /// Appends an entry with an explicit reference for kinds that do not
    /// derive one from the payload.
    ///
    /// # Errors
    ///
    /// See [`EvidenceLedger::append`].
    pub fn append_with_reference(
        &self,
        kind: EntryKind,
        payload: Value,
        reference: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        if kind == EntryKind::Genesis {
            return Err(LedgerError::GenesisAlreadyPresent);
        }
        self.append_locked(kind, payload, reference, false)
    }

    /// Appends a `stage_receipt` whose reference is the Merkle root of
    /// `leaves`.
    ///
    /// # Errors
    ///
    /// Returns an error for empty or out-of-order leaves, or a write
    /// failure.
    pub fn append_stage_receipt(
        &self,
        workflow_id: &str,
        stage: &str,
        leaves: Vec<StageLeaf>,
    ) -> Result<LedgerEntry, LedgerError> {
        let receipt = StageReceipt {
            workflow_id: workflow_id.to_string(),
            stage: stage.to_string(),
            leaves,
        };
        let payload = serde_json::to_value(&receipt).map_err(LedgerError::Serialization)?;
        self.append(EntryKind::StageReceipt, payload)
    }

    fn append_locked(
        &self,
        kind: EntryKind,
        payload: Value,
        reference: Option<&str>,
        genesis: bool,
    ) -> Result<LedgerEntry, LedgerError> {
        let reference = derive_reference(kind, &payload, reference)?;

        let mut state = self.writer.lock().map_err(|_| LedgerError::WriterPoisoned)?;
        if genesis && state.entry_count != 0 {
            return Err(LedgerError::GenesisAlreadyPresent);
        }

        // Timestamps never go backwards within a ledger.
        let timestamp = now_ms().max(state.head_timestamp);
        let record = canonical_record(kind, timestamp, &reference, &payload)?;
        let hash = ContentHasher::hash_hex(record.as_bytes());
        let previous_signature = state.head_signature.clone();
        let signature = self.signer.sign_chained(&hash, &previous_signature);

        let entry = LedgerEntry {
            kind,
            timestamp,
            reference,
            payload,
            signed_operation: SignedOperation {
                record,
                hash,
                signature,
                previous_signature,
            },
        };
        let mut line = entry.to_json_line()?;
        line.push('\n');

        self.write_line(&mut state, kind, line.as_bytes())?;

        state.entry_count += 1;
        state.head_signature.clone_from(&entry.signed_operation.signature);
        state.head_timestamp = timestamp;

        tracing::debug!(
            kind = %kind,
            index = state.entry_count - 1,
            reference = %entry.reference,
            "appended ledger entry"
        );
        Ok(entry)
    }

    fn write_line(
        &self,
        state: &mut WriterState,
        kind: EntryKind,
        line: &[u8],
    ) -> Result<(), LedgerError> {
        let primary_len = state.len;
        if let Err(source) = append_synced(&mut state.file, line) {
            rollback(&state.file, primary_len, &self.path);
            return Err(LedgerError::Write {
                path: self.path.clone(),
                source,
            });
        }

        let mirror_path = self.mirror_path(kind);
        let mirror_result = (|| -> std::io::Result<()> {
            let mirror = match state.mirrors.entry(kind) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => slot.insert(
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&mirror_path)?,
                ),
            };
            let mirror_len = mirror.metadata()?.len();
            if let Err(err) = append_synced(mirror, line) {
                rollback(mirror, mirror_len, &mirror_path);
                return Err(err);
            }
            Ok(())
        })();

        if let Err(source) = mirror_result {
            rollback(&state.file, primary_len, &self.path);
            state.mirrors.remove(&kind);
            return Err(LedgerError::Write {
                path: mirror_path,
                source,
            });
        }

        state.len = primary_len + line.len() as u64;
        Ok(())
    }

    /// Number of entries, genesis included.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterPoisoned`] if the writer lock is
    /// poisoned.
    pub fn len(&self) -> Result<u64, LedgerError> {
        Ok(self
            .writer
            .lock()
            .map_err(|_| LedgerError::WriterPoisoned)?
            .entry_count)
    }

    /// Signature of the most recent entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WriterPoisoned`] if the writer lock is
    /// poisoned.
    pub fn head_signature(&self) -> Result<String, LedgerError> {
        Ok(self
            .writer
            .lock()
            .map_err(|_| LedgerError::WriterPoisoned)?
            .head_signature
            .clone())
    }

    /// Reads every entry from the primary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is corrupt.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        read_entries(&self.path)
    }

    /// Computes summary statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        ledger_stats(&self.path)
    }
}

fn append_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line)?;
    file.sync_data()
}

fn rollback(file: &File, len: u64, path: &Path) {
    if let Err(err) = file.set_len(len).and_then(|()| file.sync_data()) {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "failed to roll back partial ledger write"
        );
    }
}

struct Recovered {
    valid_len: u64,
    entry_count: u64,
    head_signature: String,
    head_timestamp: u64,
}

fn recover(file: &mut File, path: &Path) -> Result<Recovered, LedgerError> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut recovered = Recovered {
        valid_len: 0,
        entry_count: 0,
        head_signature: ContentHasher::GENESIS_PREVIOUS_SIGNATURE.to_string(),
        head_timestamp: 0,
    };

    let mut offset = 0usize;
    let mut line_no = 0u64;
    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            tracing::warn!(
                path = %path.display(),
                line = line_no,
                "truncating unterminated tail record from evidence ledger"
            );
            break;
        };
        let line = &rest[..newline];
        let next = offset + newline + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            recovered.valid_len = offset as u64;
            continue;
        }

        let parsed = std::str::from_utf8(line)
            .map_err(|e| e.to_string())
            .and_then(|text| LedgerEntry::from_json_line(text).map_err(|e| e.to_string()));
        match parsed {
            Ok(entry) => {
                recovered.entry_count += 1;
                recovered.head_signature = entry.signed_operation.signature;
                recovered.head_timestamp = entry.timestamp;
                offset = next;
                recovered.valid_len = offset as u64;
            },
            Err(reason) => {
                return Err(LedgerError::CorruptLedger {
                    line: line_no,
                    reason,
                });
            },
        }
    }

    if recovered.valid_len < bytes.len() as u64 {
        file.set_len(recovered.valid_len)?;
        file.sync_all()?;
    }
    Ok(recovered)
}

/// A lock-free streaming reader over complete ledger lines.
///
/// Yields `(index, byte_offset, entry)`. An unterminated final line is a
/// write in progress (or a torn tail) and is not yielded.
pub struct EntryStream {
    reader: BufReader<File>,
    offset: u64,
    index: u64,
    done: bool,
}

impl EntryStream {
    /// Opens a stream from the beginning of the file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        Self::open_at(path, 0, 0)
    }

    /// Opens a stream positioned at `offset`, numbering entries from
    /// `index`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CheckpointMismatch`] when `offset` lies past
    /// the end of the file, or an I/O error.
    pub fn open_at(path: &Path, offset: u64, index: u64) -> Result<Self, LedgerError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if offset > len {
            return Err(LedgerError::CheckpointMismatch(format!(
                "offset {offset} beyond ledger length {len}"
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            index,
            done: false,
        })
    }

    /// Byte offset just past the last yielded line.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for EntryStream {
    type Item = Result<(u64, u64, LedgerEntry), LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let mut buf = Vec::new();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                },
                Ok(_) if buf.last() != Some(&b'\n') => {
                    self.done = true;
                    return None;
                },
                Ok(n) => {
                    let start = self.offset;
                    self.offset += n as u64;
                    if buf.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let index = self.index;
                    self.index += 1;
                    let parsed = std::str::from_utf8(&buf)
                        .map_err(|e| e.to_string())
                        .and_then(|text| {
                            LedgerEntry::from_json_line(text).map_err(|e| e.to_string())
                        });
                    return Some(match parsed {
                        Ok(entry) => Ok((index, start, entry)),
                        Err(reason) => {
                            self.done = true;
                            Err(LedgerError::CorruptLedger {
                                line: index + 1,
                                reason,
                            })
                        },
                    });
                },
                Err(err) => {
                    self.done = true;
                    return Some(Err(LedgerError::Io(err)));
                },
            }
        }
    }
}

/// Reads every complete entry from a ledger file without locking.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is corrupt.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    EntryStream::open(path)?
        .map(|item| item.map(|(_, _, entry)| entry))
        .collect()
}

/// Computes summary statistics for a ledger file without locking.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is corrupt.
pub fn ledger_stats(path: &Path) -> Result<LedgerStats, LedgerError> {
    let mut stats = LedgerStats {
        head_signature: ContentHasher::GENESIS_PREVIOUS_SIGNATURE.to_string(),
        ..LedgerStats::default()
    };
    for item in EntryStream::open(path)? {
        let (_, _, entry) = item?;
        stats.entry_count += 1;
        *stats.per_kind.entry(entry.kind).or_default() += 1;
        stats.head_timestamp = entry.timestamp;
        stats.head_signature = entry.signed_operation.signature;
    }
    stats.size_bytes = fs::metadata(path)?.len();
    Ok(stats)
}
