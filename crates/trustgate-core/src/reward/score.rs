//! Reward deltas from run metrics.
//!
//! Ratio metrics are scored against a target with a bounded, proportional
//! penalty:
//!
//! ```text
//! deviation = value - target           (higher is better)
//! deviation = target - value           (lower is better)
//! component = weight                                   if deviation >= 0
//! component = weight * clamp(deviation / span, -1, 0)  otherwise
//! ```
//!
//! Count metrics contribute `weight * count` with a negative weight.

use serde::{Deserialize, Serialize};

use super::ScoreError;
use super::run::{Metric, RunMetrics, WorkflowRun};
use crate::ledger::now_ms;

/// Target, weight, and penalty span for a ratio metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatioTarget {
    /// Threshold the metric must meet.
    pub target: f64,
    /// Credit for meeting the target; maximum penalty for missing it.
    pub weight: f64,
    /// Deviation at which the penalty saturates at `-weight`.
    pub span: f64,
}

impl RatioTarget {
    /// Scores `value` against this target.
    #[must_use]
    pub fn contribution(&self, value: f64, higher_is_better: bool) -> f64 {
        let deviation = if higher_is_better {
            value - self.target
        } else {
            self.target - value
        };
        if deviation >= 0.0 {
            self.weight
        } else {
            self.weight * (deviation / self.span).clamp(-1.0, 0.0)
        }
    }

    fn validate(&self, metric: Metric) -> Result<(), ScoreError> {
        let finite = self.target.is_finite() && self.weight.is_finite() && self.span.is_finite();
        if !finite || self.span <= 0.0 || self.weight < 0.0 {
            return Err(ScoreError::InvalidWeights(format!(
                "{metric}: target, weight and span must be finite, weight >= 0, span > 0"
            )));
        }
        Ok(())
    }
}

/// The reward weight table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewardWeights {
    /// Task coverage (higher is better).
    pub coverage: RatioTarget,
    /// Transient failure rate (lower is better).
    pub flake_rate: RatioTarget,
    /// Token usage over budget (lower is better).
    pub token_ratio: RatioTarget,
    /// Applied per rollback.
    pub rollback_penalty: f64,
    /// Applied per failing agent.
    pub failed_agent_penalty: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            coverage: RatioTarget {
                target: 0.85,
                weight: 2.5,
                span: 0.85,
            },
            flake_rate: RatioTarget {
                target: 0.02,
                weight: 1.5,
                span: 0.98,
            },
            token_ratio: RatioTarget {
                target: 1.0,
                weight: 1.0,
                span: 1.0,
            },
            rollback_penalty: -1.25,
            failed_agent_penalty: -1.0,
        }
    }
}

impl RewardWeights {
    /// Checks that the table is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ScoreError::InvalidWeights`] for non-finite values,
    /// non-positive spans, negative ratio weights, or positive penalties.
    pub fn validate(&self) -> Result<(), ScoreError> {
        self.coverage.validate(Metric::Coverage)?;
        self.flake_rate.validate(Metric::FlakeRate)?;
        self.token_ratio.validate(Metric::TokenRatio)?;
        for (metric, penalty) in [
            (Metric::Rollbacks, self.rollback_penalty),
            (Metric::FailedAgents, self.failed_agent_penalty),
        ] {
            if !penalty.is_finite() || penalty > 0.0 {
                return Err(ScoreError::InvalidWeights(format!(
                    "{metric}: penalty must be finite and <= 0"
                )));
            }
        }
        Ok(())
    }
}

/// Per-metric contributions to a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardComponents {
    /// Coverage contribution.
    pub coverage: f64,
    /// Flake rate contribution.
    pub flake: f64,
    /// Token ratio contribution.
    pub token: f64,
    /// Rollback penalty.
    pub rollback: f64,
    /// Failed agent penalty.
    pub failed_agents: f64,
}

impl RewardComponents {
    /// Sum of all components.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.coverage + self.flake + self.token + self.rollback + self.failed_agents
    }
}

/// The signed score of one run. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDelta {
    /// Workflow that produced the run.
    pub workflow_id: String,
    /// Agent the run is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Per-metric contributions.
    pub components: RewardComponents,
    /// Sum of `components`.
    pub total: f64,
}

impl RewardDelta {
    /// Trust subject: the agent when known, otherwise the workflow.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.agent_id.as_deref().unwrap_or(&self.workflow_id)
    }
}

/// Scores extracted metrics.
#[must_use]
pub fn score_metrics(weights: &RewardWeights, metrics: &RunMetrics) -> RewardComponents {
    RewardComponents {
        coverage: weights.coverage.contribution(metrics.coverage, true),
        flake: weights.flake_rate.contribution(metrics.flake_rate, false),
        token: weights.token_ratio.contribution(metrics.token_ratio, false),
        rollback: weights.rollback_penalty * f64::from(metrics.rollbacks),
        failed_agents: weights.failed_agent_penalty * f64::from(metrics.failed_agents),
    }
}

/// Scores a run, returning the delta and the metrics it was derived from.
#[must_use]
pub fn score_run(weights: &RewardWeights, run: &WorkflowRun) -> (RewardDelta, RunMetrics) {
    let metrics = RunMetrics::extract(run);
    let components = score_metrics(weights, &metrics);
    let delta = RewardDelta {
        workflow_id: run.workflow_id.clone(),
        agent_id: run.agent_id.clone(),
        timestamp: now_ms(),
        total: components.total(),
        components,
    };
    tracing::debug!(
        workflow_id = %delta.workflow_id,
        subject = %delta.subject(),
        total = delta.total,
        "scored workflow run"
    );
    (delta, metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::run::{RunOutcome, TaskRecord, TaskStatus};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn run(succeeded: usize, failed: usize, rollbacks: u32, usage: u64) -> WorkflowRun {
        let mut tasks = Vec::new();
        for i in 0..succeeded {
            tasks.push(TaskRecord {
                task_id: format!("ok-{i}"),
                agent_id: None,
                status: TaskStatus::Succeeded,
                tokens_used: None,
                output: None,
            });
        }
        for i in 0..failed {
            tasks.push(TaskRecord {
                task_id: format!("fail-{i}"),
                agent_id: Some("agent-x".to_string()),
                status: TaskStatus::Failed { transient: false },
                tokens_used: None,
                output: None,
            });
        }
        WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: Some("agent-a".to_string()),
            tasks,
            outcome: RunOutcome {
                token_usage: Some(usage),
                token_budget: Some(1000),
                rollbacks,
            },
        }
    }

    #[test]
    fn test_clean_run_scores_plus_five() {
        let (delta, _) = score_run(&RewardWeights::default(), &run(10, 0, 0, 800));
        let c = delta.components;
        assert!(approx(c.coverage, 2.5));
        assert!(approx(c.flake, 1.5));
        assert!(approx(c.token, 1.0));
        assert!(approx(c.rollback, 0.0));
        assert!(approx(c.failed_agents, 0.0));
        assert!(approx(delta.total, 5.0));
    }

    #[test]
    fn test_bad_run_scores_strongly_negative() {
        let (delta, metrics) = score_run(&RewardWeights::default(), &run(6, 4, 2, 1300));
        assert_eq!(metrics.failed_agents, 1);

        let c = delta.components;
        assert!(approx(c.coverage, 2.5 * (0.6 - 0.85) / 0.85));
        assert!(approx(c.flake, 1.5));
        assert!(approx(c.token, -0.3));
        assert!(approx(c.rollback, -2.5));
        assert!(approx(c.failed_agents, -1.0));
        assert!(delta.total < -3.0);
        assert!(approx(delta.total, c.total()));
    }

    #[test]
    fn test_penalty_saturates_at_weight() {
        let target = RewardWeights::default().token_ratio;
        assert!(approx(target.contribution(5.0, false), -1.0));
        assert!(approx(target.contribution(1.0, false), 1.0));
        assert!(approx(target.contribution(1.5, false), -0.5));
    }

    #[test]
    fn test_meeting_target_exactly_earns_credit() {
        let coverage = RewardWeights::default().coverage;
        assert!(approx(coverage.contribution(0.85, true), 2.5));
        assert!(approx(coverage.contribution(0.0, true), -2.5));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let mut weights = RewardWeights::default();
        assert!(weights.validate().is_ok());

        weights.coverage.span = 0.0;
        assert!(matches!(weights.validate(), Err(ScoreError::InvalidWeights(_))));

        let mut weights = RewardWeights::default();
        weights.rollback_penalty = 1.25;
        assert!(weights.validate().is_err());

        let mut weights = RewardWeights::default();
        weights.flake_rate.weight = f64::NAN;
        assert!(weights.validate().is_err());
    }
}
