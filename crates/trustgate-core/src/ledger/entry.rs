//! Ledger entry types and record canonicalization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::LedgerError;

/// Schema identifier written into the genesis payload.
pub const LEDGER_SCHEMA: &str = "trustgate.evidence.ledger.v1";

/// The kind of operation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// First entry of every ledger.
    Genesis,
    /// Workflow stage task/artifact hashes and their Merkle root.
    StageReceipt,
    /// Result of a security scan.
    SecurityScan,
    /// A task handed to an agent.
    TaskDispatch,
    /// An automated fix applied by an agent.
    AutoFixAction,
    /// Budget and reward decisions, including reward deltas.
    BudgetDecision,
    /// Trust gate approval, or a later transition of an approved candidate.
    Approval,
    /// Trust gate rejection with a reason code.
    Rejection,
    /// Outcome of a rollback simulation.
    RollbackDrill,
    /// A published audit bundle.
    AuditBundle,
}

impl EntryKind {
    /// Returns all entry kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Genesis,
            Self::StageReceipt,
            Self::SecurityScan,
            Self::TaskDispatch,
            Self::AutoFixAction,
            Self::BudgetDecision,
            Self::Approval,
            Self::Rejection,
            Self::RollbackDrill,
            Self::AuditBundle,
        ]
    }

    /// Returns the wire name, also used for mirror log file names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Genesis => "genesis",
            Self::StageReceipt => "stage_receipt",
            Self::SecurityScan => "security_scan",
            Self::TaskDispatch => "task_dispatch",
            Self::AutoFixAction => "auto_fix_action",
            Self::BudgetDecision => "budget_decision",
            Self::Approval => "approval",
            Self::Rejection => "rejection",
            Self::RollbackDrill => "rollback_drill",
            Self::AuditBundle => "audit_bundle",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LedgerError::UnknownKind(s.to_string()))
    }
}

/// The signed, chained portion of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedOperation {
    /// Canonical JSON of `{kind, timestamp, reference, payload}`.
    pub record: String,
    /// Hex SHA-256 of `record`.
    pub hash: String,
    /// Hex HMAC-SHA256 over `hash || previous_signature`.
    pub signature: String,
    /// Signature of the prior entry.
    pub previous_signature: String,
}

/// One line of the evidence ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEntry {
    /// Operation kind.
    pub kind: EntryKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Kind-specific reference (Merkle root, diff hash, checksum, ...).
    pub reference: String,
    /// Operation payload.
    pub payload: Value,
    /// Hash chain and signature.
    pub signed_operation: SignedOperation,
}

impl LedgerEntry {
    /// Returns `payload.workflow_id` when present.
    #[must_use]
    pub fn workflow_id(&self) -> Option<&str> {
        self.payload.get("workflow_id").and_then(Value::as_str)
    }

    /// Returns this entry's signature.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signed_operation.signature
    }

    /// Recomputes the canonical record from the entry's visible fields.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] if the payload cannot be
    /// canonicalized.
    pub fn recompute_record(&self) -> Result<String, LedgerError> {
        canonical_record(self.kind, self.timestamp, &self.reference, &self.payload)
    }

    /// Parses one JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] for malformed lines.
    pub fn from_json_line(line: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(line.trim_end()).map_err(LedgerError::Serialization)
    }

    /// Serializes the entry as one JSON line without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Serialization`] if serialization fails.
    pub fn to_json_line(&self) -> Result<String, LedgerError> {
        serde_json::to_string(self).map_err(LedgerError::Serialization)
    }
}

#[derive(Serialize)]
struct RecordBinding<'a> {
    kind: &'a str,
    timestamp: u64,
    reference: &'a str,
    payload: &'a Value,
}

/// Canonicalizes an entry's content (RFC 8785 JCS).
///
/// # Errors
///
/// Returns [`LedgerError::Serialization`] if the payload cannot be
/// represented canonically.
pub fn canonical_record(
    kind: EntryKind,
    timestamp: u64,
    reference: &str,
    payload: &Value,
) -> Result<String, LedgerError> {
    let binding = RecordBinding {
        kind: kind.as_str(),
        timestamp,
        reference,
        payload,
    };
    serde_jcs::to_string(&binding).map_err(LedgerError::Serialization)
}
