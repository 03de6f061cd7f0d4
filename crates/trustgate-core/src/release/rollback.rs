//! Rollback drills.
//!
//! A drill checks out an earlier commit into a throwaway git worktree,
//! runs the configured build/test commands there, and records the outcome
//! as a `rollback_drill` ledger entry. The operator's working tree is never
//! touched. Drills are not retried: a failed drill is recorded and
//! reported.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::command::{CommandError, duration_ms, run_bounded};
use super::preview::validate_commit_ref;
use crate::ledger::{EntryKind, EntryStream, EvidenceLedger, LedgerError};
use crate::log::{Redactor, redact};

/// Commit checked out when the caller names none.
pub const DEFAULT_ROLLBACK_TARGET: &str = "HEAD~1";

const MS_PER_HOUR: u64 = 60 * 60 * 1000;

/// Errors that prevent a drill from being configured or recorded.
///
/// A drill that fails, including one that never reaches checkout, is not
/// an error; it yields a
/// [`RollbackSimulationResult`] with `success == false`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RollbackError {
    /// The configuration is unusable.
    #[error("invalid rollback configuration: {0}")]
    InvalidConfig(String),

    /// The drill result could not be recorded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Drill configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RollbackConfig {
    /// Commands run in the checked-out tree, each as an argv list.
    pub commands: Vec<Vec<String>>,
    /// Minimum hours between scheduled drills.
    pub interval_hours: u64,
    /// Per-command timeout in milliseconds.
    pub command_timeout_ms: u64,
    /// Directory under which scratch worktrees are created; the system
    /// temp directory when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            commands: vec![
                vec!["cargo".to_string(), "build".to_string(), "--locked".to_string()],
                vec!["cargo".to_string(), "test".to_string(), "--locked".to_string()],
            ],
            interval_hours: 24 * 7,
            command_timeout_ms: 30 * 60 * 1000,
            scratch_dir: None,
        }
    }
}

impl RollbackConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidConfig`] for an empty argv, a zero
    /// timeout or a zero interval.
    pub fn validate(&self) -> Result<(), RollbackError> {
        if let Some(i) = self.commands.iter().position(Vec::is_empty) {
            return Err(RollbackError::InvalidConfig(format!(
                "commands[{i}] is empty"
            )));
        }
        if self.command_timeout_ms == 0 {
            return Err(RollbackError::InvalidConfig(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        if self.interval_hours == 0 {
            return Err(RollbackError::InvalidConfig(
                "interval_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn scratch_root(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Outcome of one drill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollbackSimulationResult {
    /// HEAD when the drill started.
    pub commit_from: String,
    /// Commit the drill rolled back to.
    pub commit_to: String,
    /// Whether every command passed.
    pub success: bool,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    /// Redacted failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Isolated checkouts for drills.
pub trait ScratchCheckout: Send + Sync {
    /// Full commit id of `HEAD`.
    ///
    /// # Errors
    ///
    /// Returns the failure text.
    fn head(&self) -> Result<String, String>;

    /// Full commit id of `commit_ref`.
    ///
    /// # Errors
    ///
    /// Returns the failure text.
    fn resolve(&self, commit_ref: &str) -> Result<String, String>;

    /// Checks out `commit` (detached) at `path`, which must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns the failure text.
    fn checkout(&self, commit: &str, path: &Path) -> Result<(), String>;

    /// Removes a checkout created by [`ScratchCheckout::checkout`].
    ///
    /// # Errors
    ///
    /// Returns the failure text.
    fn remove(&self, path: &Path) -> Result<(), String>;
}

/// [`ScratchCheckout`] backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitWorktreeCheckout {
    repo: PathBuf,
    timeout: Duration,
}

impl GitWorktreeCheckout {
    /// Uses the repository at `repo`; each git call is bounded by `timeout`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            timeout,
        }
    }

    fn git<I, S>(&self, args: I) -> Result<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo).args(args);
        let output = run_bounded(cmd, self.timeout).map_err(|e| e.to_string())?;
        if output.success() {
            Ok(output.stdout_trimmed())
        } else {
            Err(output.stderr_lossy().trim().to_string())
        }
    }
}

impl ScratchCheckout for GitWorktreeCheckout {
    fn head(&self) -> Result<String, String> {
        self.resolve("HEAD")
    }

    fn resolve(&self, commit_ref: &str) -> Result<String, String> {
        let spec = format!("{commit_ref}^{{commit}}");
        self.git(["rev-parse", "--verify", spec.as_str()])
    }

    fn checkout(&self, commit: &str, path: &Path) -> Result<(), String> {
        let mut args = vec![
            std::ffi::OsString::from("worktree"),
            "add".into(),
            "--detach".into(),
        ];
        args.push(path.as_os_str().to_owned());
        args.push(commit.into());
        self.git(args).map(drop)
    }

    fn remove(&self, path: &Path) -> Result<(), String> {
        let mut args = vec![
            std::ffi::OsString::from("worktree"),
            "remove".into(),
            "--force".into(),
        ];
        args.push(path.as_os_str().to_owned());
        let removed = self.git(args).map(drop);
        // Clears the administrative entry even if removal failed midway.
        if let Err(e) = self.git(["worktree", "prune"]) {
            tracing::warn!(
                repo = %self.repo.display(),
                error = %redact(&e),
                "git worktree prune failed"
            );
        }
        removed
    }
}

/// Runs rollback drills and records their outcome.
pub struct RollbackSimulator {
    config: RollbackConfig,
    checkout: Box<dyn ScratchCheckout>,
    redactor: Redactor,
}

impl std::fmt::Debug for RollbackSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackSimulator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RollbackSimulator {
    /// Creates a simulator.
    ///
    /// # Errors
    ///
    /// Returns [`RollbackError::InvalidConfig`] for an unusable
    /// configuration.
    pub fn new(
        config: RollbackConfig,
        checkout: Box<dyn ScratchCheckout>,
        redactor: Redactor,
    ) -> Result<Self, RollbackError> {
        config.validate()?;
        Ok(Self {
            config,
            checkout,
            redactor,
        })
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &RollbackConfig {
        &self.config
    }

    /// Drills a rollback to `commit` (default [`DEFAULT_ROLLBACK_TARGET`])
    /// and appends a `rollback_drill` entry.
    ///
    /// Every attempt is recorded, including one rejected before checkout
    /// (an invalid ref, an unresolvable HEAD, no scratch space). Such a
    /// drill carries an empty `commit_from` when HEAD is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error only when the result cannot be recorded.
    pub fn simulate(
        &self,
        ledger: &EvidenceLedger,
        commit: Option<&str>,
    ) -> Result<RollbackSimulationResult, RollbackError> {
        let target = commit.unwrap_or(DEFAULT_ROLLBACK_TARGET);
        let started = Instant::now();
        let (commit_from, commit_to, outcome) = self.attempt(target);

        let result = RollbackSimulationResult {
            commit_from,
            commit_to,
            success: outcome.is_ok(),
            duration: duration_ms(started.elapsed()),
            error: outcome.err().map(|e| self.redactor.redact_captured(&e)),
        };
        let payload = serde_json::to_value(&result).map_err(RollbackError::Serialization)?;
        ledger.append(EntryKind::RollbackDrill, payload)?;

        if result.success {
            tracing::info!(
                commit_from = %result.commit_from,
                commit_to = %result.commit_to,
                duration_ms = result.duration,
                "rollback drill passed"
            );
        } else {
            tracing::warn!(
                commit_from = %result.commit_from,
                commit_to = %result.commit_to,
                error = result.error.as_deref().unwrap_or_default(),
                "rollback drill failed"
            );
        }
        Ok(result)
    }

    /// Runs the drill, returning `(commit_from, commit_to, outcome)`.
    fn attempt(&self, target: &str) -> (String, String, Result<(), String>) {
        if let Err(e) = validate_commit_ref(target) {
            return (
                String::new(),
                self.redactor.redact_captured(target),
                Err(e.to_string()),
            );
        }
        let commit_from = match self.checkout.head() {
            Ok(head) => head,
            Err(e) => {
                return (
                    String::new(),
                    target.to_string(),
                    Err(format!("cannot resolve HEAD: {e}")),
                );
            },
        };

        let scratch_root = self.config.scratch_root();
        let scratch = std::fs::create_dir_all(&scratch_root).and_then(|()| {
            tempfile::Builder::new()
                .prefix("trustgate-drill-")
                .tempdir_in(&scratch_root)
        });
        let scratch = match scratch {
            Ok(scratch) => scratch,
            Err(e) => {
                return (
                    commit_from,
                    target.to_string(),
                    Err(format!(
                        "scratch directory {} unavailable: {e}",
                        scratch_root.display()
                    )),
                );
            },
        };

        let (commit_to, outcome) = match self.checkout.resolve(target) {
            Ok(resolved) => {
                let outcome = self.drill(&resolved, &scratch.path().join("worktree"));
                (resolved, outcome)
            },
            Err(e) => (
                target.to_string(),
                Err(format!("cannot resolve {target}: {e}")),
            ),
        };
        if let Err(e) = scratch.close() {
            tracing::warn!(
                path = %scratch_root.display(),
                error = %e,
                "failed to remove drill scratch directory"
            );
        }
        (commit_from, commit_to, outcome)
    }

    fn drill(&self, commit: &str, worktree: &Path) -> Result<(), String> {
        self.checkout
            .checkout(commit, worktree)
            .map_err(|e| format!("checkout of {commit} failed: {e}"))?;
        let outcome = self.run_commands(worktree);
        if let Err(e) = self.checkout.remove(worktree) {
            tracing::warn!(
                path = %worktree.display(),
                error = %self.redactor.redact_captured(&e),
                "failed to remove drill worktree"
            );
        }
        outcome
    }

    fn run_commands(&self, dir: &Path) -> Result<(), String> {
        if self.config.commands.is_empty() {
            tracing::warn!("rollback drill has no commands configured; checkout only");
        }
        for argv in &self.config.commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };
            let rendered = argv.join(" ");
            let mut cmd = Command::new(program);
            cmd.args(args).current_dir(dir);
            tracing::debug!(command = %self.redactor.redact(&rendered), "running drill command");
            let output = match run_bounded(cmd, self.config.command_timeout()) {
                Ok(output) => output,
                Err(CommandError::Timeout { timeout_ms, .. }) => {
                    return Err(format!("`{rendered}` timed out after {timeout_ms} ms"));
                },
                Err(e) => return Err(format!("`{rendered}`: {e}")),
            };
            if !output.success() {
                return Err(format!(
                    "`{rendered}` exited with {}: {}",
                    output.status,
                    output.stderr_lossy().trim()
                ));
            }
        }
        Ok(())
    }
}

/// Timestamp of the most recent `rollback_drill` entry.
///
/// # Errors
///
/// Returns an error if the ledger cannot be read.
pub fn last_drill_at(ledger_path: &Path) -> Result<Option<u64>, LedgerError> {
    let mut last = None;
    for row in EntryStream::open(ledger_path)? {
        let (_, _, entry) = row?;
        if entry.kind == EntryKind::RollbackDrill {
            last = Some(entry.timestamp);
        }
    }
    Ok(last)
}

/// Whether a scheduled drill is due at `now_ms`.
///
/// # Errors
///
/// Returns an error if the ledger cannot be read.
pub fn drill_due(
    ledger_path: &Path,
    interval_hours: u64,
    now_ms: u64,
) -> Result<bool, LedgerError> {
    Ok(match last_drill_at(ledger_path)? {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= interval_hours.saturating_mul(MS_PER_HOUR),
    })
}
