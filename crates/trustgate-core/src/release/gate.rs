//! The trust gate: decides whether a merge candidate may be auto-approved.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. attached confidence against `confidence_threshold`
//! 2. the subject's recent trust average against `trust_threshold`
//!    (a subject without history is treated as untrusted), replayed from
//!    verified `budget_decision` ledger entries
//! 3. the subject's manual-approval flag
//!
//! A candidate that passes all three is previewed and the SHA-256 of the
//! diff is bound into the `approval` ledger entry. The whole evaluation is
//! bounded by `timeout_ms`; when the deadline passes the candidate is
//! rejected with [`RejectionReason::Timeout`] and whatever the worker
//! produces afterwards is dropped.

use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approval::{ApprovalState, MergeApproval, RejectionReason};
use super::preview::MergePreview;
use crate::crypto::{ContentHasher, Signer};
use crate::ledger::{EntryKind, EvidenceLedger, LedgerEntry, LedgerError, now_ms};
use crate::reward::{RewardScorekeeper, ScoreError};

/// Errors raised by the trust gate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GateError {
    /// An approval was asked to make an illegal state change.
    #[error("invalid approval transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ApprovalState,
        /// Requested state.
        to: ApprovalState,
    },

    /// The gate configuration is unusable.
    #[error("invalid gate configuration: {0}")]
    InvalidConfig(String),

    /// The candidate is malformed.
    #[error("invalid merge candidate: {0}")]
    InvalidCandidate(String),

    /// Trust history could not be read.
    #[error(transparent)]
    Score(#[from] ScoreError),

    /// The decision could not be recorded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Minimum attached confidence, in `[0, 1]`.
    pub confidence_threshold: f64,
    /// Minimum mean reward over the lookback window.
    pub trust_threshold: f64,
    /// Number of recent deltas averaged.
    pub trust_lookback: usize,
    /// Evaluation deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            trust_threshold: 0.0,
            trust_lookback: 5,
            timeout_ms: 30_000,
        }
    }
}

impl GateConfig {
    /// Checks the thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] for a confidence threshold
    /// outside `[0, 1]`, a non-finite trust threshold, a zero lookback or a
    /// zero timeout.
    pub fn validate(&self) -> Result<(), GateError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(GateError::InvalidConfig(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !self.trust_threshold.is_finite() {
            return Err(GateError::InvalidConfig(
                "trust_threshold must be finite".to_string(),
            ));
        }
        if self.trust_lookback == 0 {
            return Err(GateError::InvalidConfig(
                "trust_lookback must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(GateError::InvalidConfig(
                "timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Evaluation deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A change proposed for automatic merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeCandidate {
    /// Candidate id.
    pub candidate_id: String,
    /// Workflow that produced the change.
    pub workflow_id: String,
    /// Agent that produced the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Merge base ref.
    pub base: String,
    /// Candidate head ref.
    pub head: String,
    /// Externally supplied confidence score in `[0, 1]`.
    pub confidence: f64,
}

impl MergeCandidate {
    /// Trust subject: the agent when known, otherwise the workflow.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.agent_id.as_deref().unwrap_or(&self.workflow_id)
    }

    fn validate(&self) -> Result<(), GateError> {
        if self.candidate_id.trim().is_empty() {
            return Err(GateError::InvalidCandidate(
                "candidate_id is empty".to_string(),
            ));
        }
        if self.workflow_id.trim().is_empty() {
            return Err(GateError::InvalidCandidate(
                "workflow_id is empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(GateError::InvalidCandidate(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Outcome computed on the worker thread.
#[derive(Debug)]
enum Verdict {
    Approve {
        diff_artifact_hash: String,
        trust_average: f64,
    },
    Reject {
        reason: RejectionReason,
        detail: String,
        trust_average: Option<f64>,
    },
}

#[derive(Serialize)]
struct DecisionPayload<'a> {
    #[serde(flatten)]
    approval: &'a MergeApproval,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    head: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trust_average: Option<f64>,
}

/// Evaluates merge candidates against trust history.
#[derive(Clone)]
pub struct TrustGate {
    config: GateConfig,
    scorekeeper: Arc<RewardScorekeeper>,
    preview: Arc<dyn MergePreview>,
}

impl std::fmt::Debug for TrustGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TrustGate {
    /// Creates a gate.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfig`] if the thresholds are unusable.
    pub fn new(
        config: GateConfig,
        scorekeeper: Arc<RewardScorekeeper>,
        preview: Arc<dyn MergePreview>,
    ) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self {
            config,
            scorekeeper,
            preview,
        })
    }

    /// Thresholds in use.
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Evaluates `candidate` and records the decision in the ledger.
    ///
    /// Always returns a decided approval (`Approved` or `Rejected`) unless
    /// the candidate is malformed, trust history is unreadable, or the
    /// ledger append fails.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn evaluate(
        &self,
        ledger: &EvidenceLedger,
        candidate: &MergeCandidate,
    ) -> Result<MergeApproval, GateError> {
        candidate.validate()?;
        let mut approval = MergeApproval::pending(
            &candidate.candidate_id,
            &candidate.workflow_id,
            candidate.agent_id.as_deref(),
        );

        let verdict = self.decide_within_deadline(ledger, candidate)?;
        let decided_at = now_ms();
        let trust_average = match verdict {
            Verdict::Approve {
                diff_artifact_hash,
                trust_average,
            } => {
                approval.approve(diff_artifact_hash, decided_at)?;
                Some(trust_average)
            },
            Verdict::Reject {
                reason,
                detail,
                trust_average,
            } => {
                approval.reject(reason, Some(detail), decided_at)?;
                trust_average
            },
        };

        let kind = if approval.state == ApprovalState::Approved {
            EntryKind::Approval
        } else {
            EntryKind::Rejection
        };
        let payload = serde_json::to_value(DecisionPayload {
            approval: &approval,
            base: Some(&candidate.base),
            head: Some(&candidate.head),
            confidence: Some(candidate.confidence),
            trust_average,
        })
        .map_err(GateError::Serialization)?;
        ledger.append(kind, payload)?;

        match approval.reason {
            Some(reason) => tracing::info!(
                candidate_id = %approval.candidate_id,
                approval_id = %approval.approval_id,
                reason = reason.code(),
                "merge candidate rejected"
            ),
            None => tracing::info!(
                candidate_id = %approval.candidate_id,
                approval_id = %approval.approval_id,
                diff_artifact_hash = approval.diff_artifact_hash.as_deref().unwrap_or_default(),
                "merge candidate approved"
            ),
        }
        Ok(approval)
    }

    /// Advances an approved candidate to `Merged`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidTransition`] unless the approval is
    /// `Approved`, or a ledger error.
    pub fn record_merge(
        &self,
        ledger: &EvidenceLedger,
        approval: &mut MergeApproval,
    ) -> Result<LedgerEntry, GateError> {
        Self::record_transition(ledger, approval, ApprovalState::Merged)
    }

    /// Marks a merged candidate as reverted.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidTransition`] unless the approval is
    /// `Merged`, or a ledger error.
    pub fn record_rollback(
        &self,
        ledger: &EvidenceLedger,
        approval: &mut MergeApproval,
    ) -> Result<LedgerEntry, GateError> {
        Self::record_transition(ledger, approval, ApprovalState::RolledBack)
    }

    fn record_transition(
        ledger: &EvidenceLedger,
        approval: &mut MergeApproval,
        next: ApprovalState,
    ) -> Result<LedgerEntry, GateError> {
        let mut advanced = approval.clone();
        advanced.transition(next, now_ms())?;
        let payload = serde_json::to_value(DecisionPayload {
            approval: &advanced,
            base: None,
            head: None,
            confidence: None,
            trust_average: None,
        })
        .map_err(GateError::Serialization)?;
        let entry = ledger.append(EntryKind::Approval, payload)?;
        *approval = advanced;
        tracing::info!(
            approval_id = %approval.approval_id,
            state = %approval.state,
            "approval advanced"
        );
        Ok(entry)
    }

    fn decide_within_deadline(
        &self,
        ledger: &EvidenceLedger,
        candidate: &MergeCandidate,
    ) -> Result<Verdict, GateError> {
        let (tx, rx) = mpsc::channel();
        let worker = self.clone();
        let owned = candidate.clone();
        let ledger_path = ledger.path().to_path_buf();
        let signer = ledger.signer().clone();
        std::thread::Builder::new()
            .name("trust-gate".to_string())
            .spawn(move || {
                // The receiver is gone once the deadline has passed.
                let _ = tx.send(worker.decide(&ledger_path, signer, &owned));
            })
            .map_err(|e| GateError::InvalidConfig(format!("cannot spawn gate worker: {e}")))?;

        match rx.recv_timeout(self.config.timeout()) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    candidate_id = %candidate.candidate_id,
                    timeout_ms = self.config.timeout_ms,
                    "trust gate evaluation timed out"
                );
                Ok(Verdict::Reject {
                    reason: RejectionReason::Timeout,
                    detail: format!(
                        "evaluation exceeded {} ms",
                        self.config.timeout_ms
                    ),
                    trust_average: None,
                })
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(Verdict::Reject {
                reason: RejectionReason::PreviewFailed,
                detail: "gate worker exited without a verdict".to_string(),
                trust_average: None,
            }),
        }
    }

    fn decide(
        &self,
        ledger_path: &Path,
        signer: Signer,
        candidate: &MergeCandidate,
    ) -> Result<Verdict, GateError> {
        if candidate.confidence < self.config.confidence_threshold {
            return Ok(Verdict::Reject {
                reason: RejectionReason::LowConfidence,
                detail: format!(
                    "confidence {} below threshold {}",
                    candidate.confidence, self.config.confidence_threshold
                ),
                trust_average: None,
            });
        }

        let subject = candidate.subject();
        let book = self.scorekeeper.verified_trust_book(ledger_path, signer)?;
        let Some(average) = book.average(subject, self.config.trust_lookback) else {
            return Ok(Verdict::Reject {
                reason: RejectionReason::LowTrust,
                detail: format!("no reward history for {subject}"),
                trust_average: None,
            });
        };
        if average < self.config.trust_threshold {
            return Ok(Verdict::Reject {
                reason: RejectionReason::LowTrust,
                detail: format!(
                    "trust average {average:.3} below threshold {}",
                    self.config.trust_threshold
                ),
                trust_average: Some(average),
            });
        }

        if book.manual_approval_required(subject) {
            return Ok(Verdict::Reject {
                reason: RejectionReason::ManualGateActive,
                detail: format!("manual approval required for {subject}"),
                trust_average: Some(average),
            });
        }

        match self.preview.diff(&candidate.base, &candidate.head) {
            Ok(diff) => Ok(Verdict::Approve {
                diff_artifact_hash: ContentHasher::hash_hex(&diff),
                trust_average: average,
            }),
            Err(err) => {
                tracing::warn!(
                    candidate_id = %candidate.candidate_id,
                    error = %err,
                    "merge preview failed"
                );
                Ok(Verdict::Reject {
                    reason: RejectionReason::PreviewFailed,
                    detail: err.to_string(),
                    trust_average: Some(average),
                })
            },
        }
    }
}
