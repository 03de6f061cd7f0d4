//! Merge approval records and their state machine.
//!
//! ```text
//! Pending -> Approved -> Merged -> RolledBack
//!        \-> Rejected
//! ```
//!
//! `Rejected` is terminal; a resubmitted candidate gets a fresh `Pending`
//! approval with a new id.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::GateError;

/// Lifecycle state of a [`MergeApproval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    /// Awaiting evaluation.
    Pending,
    /// Auto-approval granted.
    Approved,
    /// Auto-approval refused.
    Rejected,
    /// The approved change was merged.
    Merged,
    /// The merged change was reverted.
    RolledBack,
}

impl ApprovalState {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Merged => "merged",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved | Self::Rejected)
                | (Self::Approved, Self::Merged)
                | (Self::Merged, Self::RolledBack)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::RolledBack)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the gate refused a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    /// Attached confidence below the threshold.
    LowConfidence,
    /// Historical trust average below the threshold, or no history.
    LowTrust,
    /// The subject requires manual approval.
    ManualGateActive,
    /// Evaluation did not finish in time.
    Timeout,
    /// The merge diff could not be produced.
    PreviewFailed,
}

impl RejectionReason {
    /// Reason code printed by the CLI and stored in the ledger.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LowConfidence => "LowConfidence",
            Self::LowTrust => "LowTrust",
            Self::ManualGateActive => "ManualGateActive",
            Self::Timeout => "Timeout",
            Self::PreviewFailed => "PreviewFailed",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The gate's decision on one candidate submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeApproval {
    /// Unique id of this submission (UUID v4).
    pub approval_id: String,
    /// The candidate being gated.
    pub candidate_id: String,
    /// Workflow that produced the candidate.
    pub workflow_id: String,
    /// Agent that produced the candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Current state.
    pub state: ApprovalState,
    /// SHA-256 of the merge diff, once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_artifact_hash: Option<String>,
    /// Rejection reason, when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    /// Free-form detail accompanying the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Milliseconds since the Unix epoch of the last transition.
    pub decided_at: u64,
}

impl MergeApproval {
    /// A fresh `Pending` approval with a new id.
    #[must_use]
    pub fn pending(candidate_id: &str, workflow_id: &str, agent_id: Option<&str>) -> Self {
        Self {
            approval_id: Uuid::new_v4().to_string(),
            candidate_id: candidate_id.to_string(),
            workflow_id: workflow_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            state: ApprovalState::Pending,
            diff_artifact_hash: None,
            reason: None,
            detail: None,
            decided_at: 0,
        }
    }

    /// Moves to `next`, stamping `decided_at`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidTransition`] for an illegal move.
    pub fn transition(&mut self, next: ApprovalState, at: u64) -> Result<(), GateError> {
        if !self.state.can_transition_to(next) {
            return Err(GateError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.decided_at = at;
        Ok(())
    }

    /// Approves with the diff hash.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidTransition`] unless `Pending`.
    pub fn approve(&mut self, diff_artifact_hash: String, at: u64) -> Result<(), GateError> {
        self.transition(ApprovalState::Approved, at)?;
        self.diff_artifact_hash = Some(diff_artifact_hash);
        Ok(())
    }

    /// Rejects with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidTransition`] unless `Pending`.
    pub fn reject(
        &mut self,
        reason: RejectionReason,
        detail: Option<String>,
        at: u64,
    ) -> Result<(), GateError> {
        self.transition(ApprovalState::Rejected, at)?;
        self.reason = Some(reason);
        self.detail = detail;
        Ok(())
    }

    /// A new `Pending` submission for the same candidate.
    #[must_use]
    pub fn resubmit(&self) -> Self {
        Self::pending(&self.candidate_id, &self.workflow_id, self.agent_id.as_deref())
    }
}
