//! Trust records replayed from reward history.
//!
//! Each subject (agent id, else workflow id) accumulates a running sum and a
//! rolling trend. The manual-approval flag trips on a poor trend or a deeply
//! negative cumulative score, and clears only once the trend rises strictly
//! above `clear_trend`:
//!
//! ```text
//! clear:  trend < trend_floor                      -> set
//!         cumulative < cumulative_floor, total <= 0 -> set
//! set:    trend > clear_trend                      -> clear
//! ```
//!
//! The gap between `trend_floor` and `clear_trend` keeps marginal runs from
//! toggling the flag.

// Window sizes are small.
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ScoreError;
use super::score::RewardDelta;

/// Gate thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrustPolicy {
    /// Number of recent totals averaged into the trend.
    pub trend_window: usize,
    /// Trip when cumulative score falls below this on a non-positive delta,
    /// unless the trend is still above `clear_trend`.
    pub cumulative_floor: f64,
    /// Trip when the trend falls below this.
    pub trend_floor: f64,
    /// Clear only when the trend is strictly above this.
    pub clear_trend: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            trend_window: 5,
            cumulative_floor: -5.0,
            trend_floor: -0.5,
            clear_trend: 0.0,
        }
    }
}

impl TrustPolicy {
    /// Checks that the thresholds are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ScoreError::InvalidPolicy`] for a zero window, non-finite
    /// thresholds, or a clear threshold below the trip threshold.
    pub fn validate(&self) -> Result<(), ScoreError> {
        if self.trend_window == 0 {
            return Err(ScoreError::InvalidPolicy(
                "trend_window must be at least 1".to_string(),
            ));
        }
        if ![self.cumulative_floor, self.trend_floor, self.clear_trend]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ScoreError::InvalidPolicy(
                "thresholds must be finite".to_string(),
            ));
        }
        if self.clear_trend < self.trend_floor {
            return Err(ScoreError::InvalidPolicy(format!(
                "clear_trend ({}) must not be below trend_floor ({})",
                self.clear_trend, self.trend_floor
            )));
        }
        Ok(())
    }
}

/// Derived trust view for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentTrustRecord {
    /// Agent id, or workflow id for runs without an agent.
    pub agent_id: String,
    /// Sum of every delta.
    pub cumulative_score: f64,
    /// Mean of the last `trend_window` deltas.
    pub trend: f64,
    /// Whether auto-approval is suspended.
    pub manual_approval_required: bool,
    /// Number of deltas replayed.
    pub runs: u64,
}

#[derive(Debug, Clone, Default)]
struct SubjectState {
    cumulative: f64,
    totals: Vec<f64>,
    flagged: bool,
}

impl SubjectState {
    fn mean_of_last(&self, n: usize) -> Option<f64> {
        if self.totals.is_empty() || n == 0 {
            return None;
        }
        let start = self.totals.len().saturating_sub(n);
        let window = &self.totals[start..];
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    fn apply(&mut self, subject: &str, total: f64, policy: &TrustPolicy) {
        self.cumulative += total;
        self.totals.push(total);
        let trend = self.mean_of_last(policy.trend_window).unwrap_or(0.0);

        if self.flagged {
            if trend > policy.clear_trend {
                self.flagged = false;
                tracing::info!(
                    subject,
                    trend,
                    cumulative = self.cumulative,
                    "manual approval requirement cleared"
                );
            }
        } else if trend < policy.trend_floor
            || (self.cumulative < policy.cumulative_floor
                && total <= 0.0
                && trend <= policy.clear_trend)
        {
            self.flagged = true;
            tracing::warn!(
                subject,
                trend,
                cumulative = self.cumulative,
                "manual approval now required"
            );
        }
    }
}

/// Replays deltas in order into per-subject trust state.
#[derive(Debug, Clone, Default)]
pub struct TrustBook {
    policy: TrustPolicy,
    subjects: BTreeMap<String, SubjectState>,
}

impl TrustBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            policy,
            subjects: BTreeMap::new(),
        }
    }

    /// Replays a full history.
    #[must_use]
    pub fn replay<'a>(
        policy: TrustPolicy,
        deltas: impl IntoIterator<Item = &'a RewardDelta>,
    ) -> Self {
        let mut book = Self::new(policy);
        for delta in deltas {
            book.apply(delta);
        }
        book
    }

    /// Applies one delta.
    pub fn apply(&mut self, delta: &RewardDelta) {
        let subject = delta.subject();
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .apply(subject, delta.total, &self.policy);
    }

    /// Trust record for `subject`.
    #[must_use]
    pub fn record(&self, subject: &str) -> Option<AgentTrustRecord> {
        self.subjects
            .get(subject)
            .map(|state| self.to_record(subject, state))
    }

    /// All records, sorted by subject.
    #[must_use]
    pub fn records(&self) -> Vec<AgentTrustRecord> {
        self.subjects
            .iter()
            .map(|(subject, state)| self.to_record(subject, state))
            .collect()
    }

    /// Mean of the last `lookback` totals; `None` without history.
    #[must_use]
    pub fn average(&self, subject: &str, lookback: usize) -> Option<f64> {
        self.subjects.get(subject)?.mean_of_last(lookback)
    }

    /// Whether auto-approval is suspended for `subject`.
    #[must_use]
    pub fn manual_approval_required(&self, subject: &str) -> bool {
        self.subjects.get(subject).is_some_and(|s| s.flagged)
    }

    fn to_record(&self, subject: &str, state: &SubjectState) -> AgentTrustRecord {
        AgentTrustRecord {
            agent_id: subject.to_string(),
            cumulative_score: state.cumulative,
            trend: state.mean_of_last(self.policy.trend_window).unwrap_or(0.0),
            manual_approval_required: state.flagged,
            runs: state.totals.len() as u64,
        }
    }
}
