//! Append-only evidence ledger.
//!
//! The ledger records every trust-relevant operation as one JSON line in
//! `ledger.jsonl`. Entries are chained: each carries the HMAC signature of
//! its predecessor, so reordering, removing, or editing any entry breaks
//! verification from that point on.
//!
//! # Components
//!
//! - [`EvidenceLedger`]: the single writer (genesis bootstrap, fail-closed
//!   appends, per-kind mirror logs, torn-tail recovery)
//! - [`LedgerVerifier`]: lazy, filterable, resumable chain verification
//! - [`MerkleTree`]: stage receipt roots and inclusion proofs
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trustgate_core::crypto::{Signer, SigningSecret};
//! use trustgate_core::ledger::{EntryKind, EvidenceLedger, LedgerVerifier, VerifyFilter};
//!
//! let signer = Signer::new(SigningSecret::generate()?);
//! let ledger = EvidenceLedger::open("storage/db/evidence/ledger.jsonl", signer.clone())?;
//! ledger.append(EntryKind::SecurityScan, json!({"workflow_id": "wf-1", "findings": 0}))?;
//!
//! for row in LedgerVerifier::new(ledger.path(), Some(signer), VerifyFilter::verify_all())? {
//!     let row = row?;
//!     assert!(!row.status.is_failed());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod entry;
mod merkle;
mod storage;
mod verify;

#[cfg(test)]
mod tests;

pub use entry::{EntryKind, LEDGER_SCHEMA, LedgerEntry, SignedOperation, canonical_record};
pub use merkle::{MerkleError, MerkleProof, MerkleTree, ProofStep, StageLeaf, stage_root_hex};
pub use storage::{
    EntryStream, EvidenceLedger, LedgerError, LedgerStats, StageReceipt, derive_reference,
    ledger_stats, now_ms, read_entries,
};
pub use verify::{
    LedgerVerifier, VerificationFailure, VerificationStatus, VerifiedEntry, VerifyCheckpoint,
    VerifyFilter,
};
