//! Workflow run input and metric extraction.
//!
//! Each metric has its own extractor with an explicit default for missing
//! input. Applied defaults are logged and recorded on [`RunMetrics`] so a
//! delta can always be traced back to what was actually measured.

// Task counts are far below 2^52.
#![allow(clippy::cast_precision_loss)]

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Completed successfully.
    Succeeded,
    /// Failed. Transient failures count as flakes rather than agent faults.
    Failed {
        /// Whether the failure is considered transient.
        #[serde(default)]
        transient: bool,
    },
    /// Not run.
    Skipped,
}

/// One task inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskRecord {
    /// Task identifier.
    pub task_id: String,
    /// Agent that executed the task, if not the run's agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Task outcome.
    pub status: TaskStatus,
    /// Tokens consumed, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    /// Raw task output, hashed into stage receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Run-level outcome measurements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunOutcome {
    /// Total tokens used; summed from tasks when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
    /// Token budget for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    /// Rollbacks triggered by this run.
    #[serde(default)]
    pub rollbacks: u32,
}

/// A completed workflow run, the input to scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowRun {
    /// Workflow identifier.
    pub workflow_id: String,
    /// Agent the run is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    /// Run-level outcome.
    #[serde(default)]
    pub outcome: RunOutcome,
}

impl WorkflowRun {
    /// Trust subject: the agent when known, otherwise the workflow.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.agent_id.as_deref().unwrap_or(&self.workflow_id)
    }
}

/// A scored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `succeeded / total`.
    Coverage,
    /// `transient failures / total`.
    FlakeRate,
    /// `usage / budget`.
    TokenRatio,
    /// Rollback count.
    Rollbacks,
    /// Distinct agents with a non-transient failure.
    FailedAgents,
}

impl Metric {
    /// Returns all metrics.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Coverage,
            Self::FlakeRate,
            Self::TokenRatio,
            Self::Rollbacks,
            Self::FailedAgents,
        ]
    }

    /// Returns the metric name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Coverage => "coverage",
            Self::FlakeRate => "flake_rate",
            Self::TokenRatio => "token_ratio",
            Self::Rollbacks => "rollbacks",
            Self::FailedAgents => "failed_agents",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics extracted from a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// `succeeded / total`, 0.0 for an empty run.
    pub coverage: f64,
    /// `transient failures / total`, 0.0 for an empty run.
    pub flake_rate: f64,
    /// `usage / budget`, 1.0 when either is missing.
    pub token_ratio: f64,
    /// Rollback count.
    pub rollbacks: u32,
    /// Distinct agents with a non-transient failure.
    pub failed_agents: u32,
    /// Metrics that fell back to their default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defaults_applied: Vec<Metric>,
}

impl RunMetrics {
    /// Extracts every metric from `run`.
    #[must_use]
    pub fn extract(run: &WorkflowRun) -> Self {
        let mut defaults_applied = Vec::new();
        let mut track = |metric: Metric, (value, defaulted): (f64, bool)| {
            if defaulted {
                defaults_applied.push(metric);
            }
            value
        };

        let coverage = track(Metric::Coverage, coverage(run));
        let flake_rate = track(Metric::FlakeRate, flake_rate(run));
        let token_ratio = track(Metric::TokenRatio, token_ratio(run));

        Self {
            coverage,
            flake_rate,
            token_ratio,
            rollbacks: run.outcome.rollbacks,
            failed_agents: failed_agents(run),
            defaults_applied,
        }
    }
}

fn task_fraction(
    run: &WorkflowRun,
    metric: Metric,
    pred: impl Fn(&TaskStatus) -> bool,
) -> (f64, bool) {
    let total = run.tasks.len();
    if total == 0 {
        tracing::warn!(
            workflow_id = %run.workflow_id,
            metric = %metric,
            "run has no tasks; defaulting metric to 0.0"
        );
        return (0.0, true);
    }
    let hits = run.tasks.iter().filter(|t| pred(&t.status)).count();
    (hits as f64 / total as f64, false)
}

/// `succeeded / total`; `(value, defaulted)`.
#[must_use]
pub fn coverage(run: &WorkflowRun) -> (f64, bool) {
    task_fraction(run, Metric::Coverage, |s| matches!(s, TaskStatus::Succeeded))
}

/// `transient failures / total`; `(value, defaulted)`.
#[must_use]
pub fn flake_rate(run: &WorkflowRun) -> (f64, bool) {
    task_fraction(run, Metric::FlakeRate, |s| {
        matches!(s, TaskStatus::Failed { transient: true })
    })
}

/// Token usage: the outcome's figure, else the sum of per-task figures.
#[must_use]
pub fn token_usage(run: &WorkflowRun) -> Option<u64> {
    run.outcome.token_usage.or_else(|| {
        run.tasks
            .iter()
            .filter_map(|t| t.tokens_used)
            .reduce(u64::saturating_add)
    })
}

/// `usage / budget`; `(value, defaulted)`. Missing usage or a missing or
/// zero budget yields 1.0.
#[must_use]
pub fn token_ratio(run: &WorkflowRun) -> (f64, bool) {
    match (token_usage(run), run.outcome.token_budget) {
        (Some(usage), Some(budget)) if budget > 0 => (usage as f64 / budget as f64, false),
        (usage, budget) => {
            tracing::warn!(
                workflow_id = %run.workflow_id,
                token_usage = ?usage,
                token_budget = ?budget,
                "token budget or usage missing; defaulting token ratio to 1.0"
            );
            (1.0, true)
        },
    }
}

/// Distinct agents with at least one non-transient failure. Tasks without
/// an agent are attributed to the run's agent, then the workflow.
#[must_use]
pub fn failed_agents(run: &WorkflowRun) -> u32 {
    let agents: BTreeSet<&str> = run
        .tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Failed { transient: false }))
        .map(|t| t.agent_id.as_deref().unwrap_or_else(|| run.subject()))
        .collect();
    u32::try_from(agents.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            agent_id: None,
            status,
            tokens_used: None,
            output: None,
        }
    }

    #[test]
    fn test_status_wire_format() {
        let run: WorkflowRun = serde_json::from_str(
            r#"{
                "workflow_id": "wf",
                "tasks": [
                    {"task_id": "a", "status": "succeeded"},
                    {"task_id": "b", "status": {"failed": {"transient": true}}},
                    {"task_id": "c", "status": {"failed": {}}},
                    {"task_id": "d", "status": "skipped"}
                ],
                "outcome": {"rollbacks": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(run.tasks[1].status, TaskStatus::Failed { transient: true });
        assert_eq!(run.tasks[2].status, TaskStatus::Failed { transient: false });
        assert_eq!(run.outcome.rollbacks, 1);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = serde_json::from_str::<WorkflowRun>(r#"{"workflow_id":"wf","extra":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_extract_counts() {
        let mut tasks = vec![task("ok", TaskStatus::Succeeded); 7];
        tasks.push(task("flaky", TaskStatus::Failed { transient: true }));
        let mut broken = task("broken", TaskStatus::Failed { transient: false });
        broken.agent_id = Some("agent-b".to_string());
        tasks.push(broken.clone());
        tasks.push(broken);

        let run = WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: Some("agent-a".to_string()),
            tasks,
            outcome: RunOutcome {
                token_usage: Some(800),
                token_budget: Some(1000),
                rollbacks: 2,
            },
        };
        let metrics = RunMetrics::extract(&run);
        assert!((metrics.coverage - 0.7).abs() < 1e-12);
        assert!((metrics.flake_rate - 0.1).abs() < 1e-12);
        assert!((metrics.token_ratio - 0.8).abs() < 1e-12);
        assert_eq!(metrics.rollbacks, 2);
        assert_eq!(metrics.failed_agents, 1);
        assert!(metrics.defaults_applied.is_empty());
    }

    #[test]
    fn test_missing_budget_defaults_ratio() {
        let run = WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: None,
            tasks: vec![task("a", TaskStatus::Succeeded)],
            outcome: RunOutcome {
                token_usage: Some(500),
                token_budget: Some(0),
                rollbacks: 0,
            },
        };
        let metrics = RunMetrics::extract(&run);
        assert!((metrics.token_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.defaults_applied, vec![Metric::TokenRatio]);
    }

    #[test]
    fn test_usage_summed_from_tasks() {
        let mut a = task("a", TaskStatus::Succeeded);
        a.tokens_used = Some(300);
        let mut b = task("b", TaskStatus::Succeeded);
        b.tokens_used = Some(200);
        let run = WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: None,
            tasks: vec![a, b],
            outcome: RunOutcome {
                token_usage: None,
                token_budget: Some(1000),
                rollbacks: 0,
            },
        };
        assert_eq!(token_usage(&run), Some(500));
        assert_eq!(token_ratio(&run), (0.5, false));
    }

    #[test]
    fn test_empty_run_defaults() {
        let run = WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: None,
            tasks: Vec::new(),
            outcome: RunOutcome::default(),
        };
        let metrics = RunMetrics::extract(&run);
        assert_eq!(metrics.coverage, 0.0);
        assert_eq!(metrics.flake_rate, 0.0);
        assert_eq!(
            metrics.defaults_applied,
            vec![Metric::Coverage, Metric::FlakeRate, Metric::TokenRatio]
        );
    }

    #[test]
    fn test_subject_falls_back_to_workflow() {
        let mut run = WorkflowRun {
            workflow_id: "wf".to_string(),
            agent_id: None,
            tasks: Vec::new(),
            outcome: RunOutcome::default(),
        };
        assert_eq!(run.subject(), "wf");
        run.agent_id = Some("agent".to_string());
        assert_eq!(run.subject(), "agent");
    }
}
