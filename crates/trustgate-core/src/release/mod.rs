//! Release control: the trust gate, rollback drills and audit bundles.
//!
//! [`ReleaseController`] owns the evidence ledger and the reward
//! scorekeeper and routes every release decision through them:
//!
//! - [`ReleaseController::evaluate`] gates a merge candidate on confidence,
//!   trust history and the manual-approval flag, binding the merge diff
//!   hash into an `approval` entry
//! - [`ReleaseController::simulate_rollback`] drills a rollback in a
//!   scratch worktree and records a `rollback_drill` entry
//! - [`ReleaseController::publish_audit_bundle`] writes a signed bundle and
//!   records an `audit_bundle` entry
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trustgate_core::config::TrustGateConfig;
//! use trustgate_core::crypto::{Signer, SigningSecret};
//! use trustgate_core::ledger::EvidenceLedger;
//! use trustgate_core::release::{MergeCandidate, ReleaseController};
//! use trustgate_core::reward::RewardScorekeeper;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrustGateConfig::default();
//! let signer = Signer::new(SigningSecret::from_env("TRUSTGATE_SIGNING_SECRET")?);
//! let ledger = EvidenceLedger::open(config.storage.ledger_path(), signer)?;
//! let scorekeeper = RewardScorekeeper::new(
//!     config.reward.weights,
//!     config.reward.policy,
//!     config.storage.history_path(),
//! )?;
//! let controller = ReleaseController::with_git(".", &config, ledger, Arc::new(scorekeeper))?;
//!
//! let approval = controller.evaluate(&MergeCandidate {
//!     candidate_id: "cand-42".to_string(),
//!     workflow_id: "wf-7".to_string(),
//!     agent_id: Some("agent-a".to_string()),
//!     base: "main".to_string(),
//!     head: "agent/fix-42".to_string(),
//!     confidence: 0.91,
//! })?;
//! println!("{} {:?}", approval.state, approval.reason);
//! # Ok(())
//! # }
//! ```

mod approval;
mod audit;
mod command;
mod gate;
mod preview;
mod rollback;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use approval::{ApprovalState, MergeApproval, RejectionReason};
pub use audit::{
    AuditBundle, AuditConfig, AuditError, PublishedBundle, ReleaseMetadata, bundle_checksum,
    publish_audit_bundle, signature_path, verify_audit_bundle, verify_audit_bundle_bytes,
    verify_audit_file,
};
pub use command::{CommandError, CommandOutput, MAX_OUTPUT_BYTES, run_bounded};
pub use gate::{GateConfig, GateError, MergeCandidate, TrustGate};
pub use preview::{DIFF_FLAGS, GitMergePreview, MergePreview, PreviewError, validate_commit_ref};
pub use rollback::{
    DEFAULT_ROLLBACK_TARGET, GitWorktreeCheckout, RollbackConfig, RollbackError,
    RollbackSimulationResult, RollbackSimulator, ScratchCheckout, drill_due, last_drill_at,
};

use crate::config::TrustGateConfig;
use crate::ledger::{EvidenceLedger, LedgerEntry, LedgerError, now_ms};
use crate::log::Redactor;
use crate::reward::{RewardScorekeeper, ScoreError};

/// Ties the ledger, the scorekeeper, the gate, the drill runner and the
/// audit publisher together.
#[derive(Debug)]
pub struct ReleaseController {
    ledger: EvidenceLedger,
    scorekeeper: Arc<RewardScorekeeper>,
    gate: TrustGate,
    rollback: RollbackSimulator,
    audit: AuditConfig,
    audit_dir: PathBuf,
}

impl ReleaseController {
    /// Assembles a controller from its parts.
    #[must_use]
    pub fn new(
        ledger: EvidenceLedger,
        scorekeeper: Arc<RewardScorekeeper>,
        gate: TrustGate,
        rollback: RollbackSimulator,
        audit: AuditConfig,
        audit_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            scorekeeper,
            gate,
            rollback,
            audit,
            audit_dir: audit_dir.into(),
        }
    }

    /// A controller whose preview and drills run against the git
    /// repository at `repo`.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate or rollback configuration is invalid.
    pub fn with_git(
        repo: impl AsRef<Path>,
        config: &TrustGateConfig,
        ledger: EvidenceLedger,
        scorekeeper: Arc<RewardScorekeeper>,
    ) -> Result<Self, ReleaseError> {
        let repo = repo.as_ref();
        let preview = GitMergePreview::new(repo, config.gate.timeout());
        let gate = TrustGate::new(config.gate, Arc::clone(&scorekeeper), Arc::new(preview))?;
        let checkout = GitWorktreeCheckout::new(repo, config.rollback.command_timeout());
        let rollback = RollbackSimulator::new(
            config.rollback.clone(),
            Box::new(checkout),
            Redactor::new(),
        )?;
        Ok(Self::new(
            ledger,
            scorekeeper,
            gate,
            rollback,
            config.audit.clone(),
            config.storage.audit_dir(),
        ))
    }

    /// The evidence ledger.
    #[must_use]
    pub const fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    /// The reward scorekeeper.
    #[must_use]
    pub fn scorekeeper(&self) -> &RewardScorekeeper {
        &self.scorekeeper
    }

    /// The trust gate.
    #[must_use]
    pub const fn gate(&self) -> &TrustGate {
        &self.gate
    }

    /// Evaluates a merge candidate and records the decision.
    ///
    /// # Errors
    ///
    /// See [`TrustGate::evaluate`].
    pub fn evaluate(&self, candidate: &MergeCandidate) -> Result<MergeApproval, GateError> {
        self.gate.evaluate(&self.ledger, candidate)
    }

    /// Records that an approved candidate was merged.
    ///
    /// # Errors
    ///
    /// See [`TrustGate::record_merge`].
    pub fn record_merge(&self, approval: &mut MergeApproval) -> Result<LedgerEntry, GateError> {
        self.gate.record_merge(&self.ledger, approval)
    }

    /// Records that a merged candidate was reverted.
    ///
    /// # Errors
    ///
    /// See [`TrustGate::record_rollback`].
    pub fn record_rollback(&self, approval: &mut MergeApproval) -> Result<LedgerEntry, GateError> {
        self.gate.record_rollback(&self.ledger, approval)
    }

    /// Runs a rollback drill to `commit`.
    ///
    /// # Errors
    ///
    /// See [`RollbackSimulator::simulate`].
    pub fn simulate_rollback(
        &self,
        commit: Option<&str>,
    ) -> Result<RollbackSimulationResult, RollbackError> {
        self.rollback.simulate(&self.ledger, commit)
    }

    /// Whether a scheduled drill is due now.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn drill_due(&self) -> Result<bool, LedgerError> {
        drill_due(
            self.ledger.path(),
            self.rollback.config().interval_hours,
            now_ms(),
        )
    }

    /// Publishes a signed audit bundle for the current trust state, as
    /// replayed from the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger is unreadable or publishing fails.
    pub fn publish_audit_bundle(
        &self,
        commit: Option<&str>,
    ) -> Result<PublishedBundle, ReleaseError> {
        let summary = self
            .scorekeeper
            .verified_trust_book(self.ledger.path(), self.ledger.signer().clone())?
            .records();
        Ok(publish_audit_bundle(
            &self.ledger,
            summary,
            &self.audit,
            &self.audit_dir,
            commit,
        )?)
    }

    /// Verifies a bundle file under this ledger's signing secret.
    ///
    /// # Errors
    ///
    /// See [`verify_audit_file`].
    pub fn verify_audit_bundle(&self, path: &Path) -> Result<AuditBundle, AuditError> {
        verify_audit_file(path, self.ledger.signer())
    }
}

/// Errors from assembling a controller or publishing through it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReleaseError {
    /// Gate construction or evaluation failed.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// Drill construction failed.
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    /// Audit publishing failed.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Trust history could not be read.
    #[error(transparent)]
    Score(#[from] ScoreError),
}
