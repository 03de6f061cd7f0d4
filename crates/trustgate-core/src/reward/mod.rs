//! Reward scoring and trust tracking.
//!
//! The [`RewardScorekeeper`] turns a completed [`WorkflowRun`] into a
//! [`RewardDelta`], records it as a `budget_decision` ledger entry and in
//! the reward history store, and replays that history into per-subject
//! [`AgentTrustRecord`]s that drive the trust gate.
//!
//! The history store is a cache of the ledger: it can always be rebuilt
//! from verified `budget_decision` entries with
//! [`RewardScorekeeper::rebuild_history_from_ledger`]. The trust gate reads
//! [`RewardScorekeeper::verified_trust_book`], which replays the ledger
//! itself.

mod history;
mod run;
mod score;
mod trust;

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub use history::RewardHistory;
pub use run::{
    Metric, RunMetrics, RunOutcome, TaskRecord, TaskStatus, WorkflowRun, coverage,
    failed_agents, flake_rate, token_ratio, token_usage,
};
pub use score::{
    RatioTarget, RewardComponents, RewardDelta, RewardWeights, score_metrics, score_run,
};
pub use trust::{AgentTrustRecord, TrustBook, TrustPolicy};

use crate::crypto::Signer;
use crate::ledger::{
    EntryKind, EvidenceLedger, LedgerError, LedgerVerifier, VerificationStatus, VerifyFilter,
};

/// `payload.decision` marking a reward delta among budget decisions.
pub const REWARD_DELTA_DECISION: &str = "reward_delta";

/// Errors raised by scoring and trust tracking.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScoreError {
    /// The weight table is unusable.
    #[error("invalid reward weights: {0}")]
    InvalidWeights(String),

    /// The trust policy is unusable.
    #[error("invalid trust policy: {0}")]
    InvalidPolicy(String),

    /// Reading or writing the history store failed.
    #[error("reward history I/O error ({path}): {source}")]
    History {
        /// History file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A history line failed to parse.
    #[error("corrupt reward history at line {line}: {reason}")]
    CorruptHistory {
        /// 1-based line number.
        line: usize,
        /// Parse failure.
        reason: String,
    },

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    /// The evidence ledger rejected the append.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Serialize)]
struct RewardDecisionPayload<'a> {
    decision: &'static str,
    #[serde(flatten)]
    delta: &'a RewardDelta,
    metrics: &'a RunMetrics,
}

/// Scores runs and maintains trust history.
#[derive(Debug, Clone)]
pub struct RewardScorekeeper {
    weights: RewardWeights,
    policy: TrustPolicy,
    history: RewardHistory,
}

impl RewardScorekeeper {
    /// Creates a scorekeeper writing history to `history_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights or policy fail validation.
    pub fn new(
        weights: RewardWeights,
        policy: TrustPolicy,
        history_path: impl Into<PathBuf>,
    ) -> Result<Self, ScoreError> {
        weights.validate()?;
        policy.validate()?;
        Ok(Self {
            weights,
            policy,
            history: RewardHistory::new(history_path),
        })
    }

    /// The weight table in use.
    #[must_use]
    pub const fn weights(&self) -> &RewardWeights {
        &self.weights
    }

    /// The trust policy in use.
    #[must_use]
    pub const fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// The history store.
    #[must_use]
    pub const fn history(&self) -> &RewardHistory {
        &self.history
    }

    /// Scores a run without recording it.
    #[must_use]
    pub fn score(&self, run: &WorkflowRun) -> RewardDelta {
        score_run(&self.weights, run).0
    }

    /// Scores a run, appends a `budget_decision` entry, then appends the
    /// delta to the history store.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger append or history write fails. When
    /// only the history write fails the ledger already holds the delta and
    /// the store can be rebuilt from it.
    pub fn record(
        &self,
        ledger: &EvidenceLedger,
        run: &WorkflowRun,
    ) -> Result<RewardDelta, ScoreError> {
        let (delta, metrics) = score_run(&self.weights, run);
        let payload = serde_json::to_value(RewardDecisionPayload {
            decision: REWARD_DELTA_DECISION,
            delta: &delta,
            metrics: &metrics,
        })
        .map_err(ScoreError::Serialization)?;
        ledger.append(EntryKind::BudgetDecision, payload)?;

        if let Err(err) = self.history.append(&delta) {
            tracing::error!(
                workflow_id = %delta.workflow_id,
                error = %err,
                "reward delta is in the ledger but not the history store; rebuild history"
            );
            return Err(err);
        }

        tracing::info!(
            workflow_id = %delta.workflow_id,
            subject = %delta.subject(),
            total = delta.total,
            "recorded reward delta"
        );
        Ok(delta)
    }

    /// Replays the full history.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store cannot be read.
    pub fn trust_book(&self) -> Result<TrustBook, ScoreError> {
        let deltas = self.history.load()?;
        Ok(TrustBook::replay(self.policy, &deltas))
    }

    /// Trust records for every subject, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store cannot be read.
    pub fn trust_records(&self) -> Result<Vec<AgentTrustRecord>, ScoreError> {
        Ok(self.trust_book()?.records())
    }

    /// Mean of the last `lookback` totals for `subject`; `None` without
    /// history.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store cannot be read.
    pub fn trust_average(
        &self,
        subject: &str,
        lookback: usize,
    ) -> Result<Option<f64>, ScoreError> {
        Ok(self.trust_book()?.average(subject, lookback))
    }

    /// Whether auto-approval is suspended for `subject`.
    ///
    /// # Errors
    ///
    /// Returns an error if the history store cannot be read.
    pub fn manual_approval_required(&self, subject: &str) -> Result<bool, ScoreError> {
        Ok(self.trust_book()?.manual_approval_required(subject))
    }

    /// Replays verified `budget_decision` entries from the ledger.
    ///
    /// The history store is compared against the ledger and rewritten when
    /// it diverges, so edits to the store never reach the trust gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn verified_trust_book(
        &self,
        ledger_path: &Path,
        signer: Signer,
    ) -> Result<TrustBook, ScoreError> {
        let deltas = ledger_deltas(ledger_path, Some(signer))?;
        let in_sync = match self.history.load() {
            Ok(cached) => cached == deltas,
            Err(err) => {
                tracing::warn!(error = %err, "reward history unreadable");
                false
            },
        };
        if !in_sync {
            tracing::warn!(
                path = %self.history.path().display(),
                deltas = deltas.len(),
                "reward history diverges from ledger; rewriting it"
            );
            if let Err(err) = self.history.replace(&deltas) {
                tracing::warn!(error = %err, "failed to rewrite reward history");
            }
        }
        Ok(TrustBook::replay(self.policy, &deltas))
    }

    /// Regenerates the history store from verified `budget_decision`
    /// entries, returning the number of deltas written.
    ///
    /// Entries that fail verification are skipped and logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or the store cannot
    /// be written.
    pub fn rebuild_history_from_ledger(
        &self,
        ledger_path: &Path,
        signer: Option<Signer>,
    ) -> Result<usize, ScoreError> {
        let deltas = ledger_deltas(ledger_path, signer)?;
        self.history.replace(&deltas)?;
        tracing::info!(
            path = %self.history.path().display(),
            deltas = deltas.len(),
            "rebuilt reward history from ledger"
        );
        Ok(deltas.len())
    }
}

/// Reward deltas carried by verified `budget_decision` entries, in ledger
/// order.
fn ledger_deltas(
    ledger_path: &Path,
    signer: Option<Signer>,
) -> Result<Vec<RewardDelta>, ScoreError> {
    let filter = VerifyFilter::verify_all().with_kinds([EntryKind::BudgetDecision]);
    let mut deltas = Vec::new();
    for row in LedgerVerifier::new(ledger_path, signer, filter)? {
        let row = row?;
        if let VerificationStatus::Failed(failure) = &row.status {
            tracing::warn!(
                index = row.index,
                reason = failure.code(),
                "skipping unverified budget decision"
            );
            continue;
        }
        let is_reward = row
            .entry
            .payload
            .get("decision")
            .and_then(serde_json::Value::as_str)
            == Some(REWARD_DELTA_DECISION);
        if !is_reward {
            continue;
        }
        match serde_json::from_value::<RewardDelta>(row.entry.payload) {
            Ok(delta) => deltas.push(delta),
            Err(err) => tracing::warn!(
                index = row.index,
                error = %err,
                "skipping malformed reward delta"
            ),
        }
    }
    Ok(deltas)
}
