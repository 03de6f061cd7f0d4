//! Deterministic merge previews.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;

use super::command::{CommandError, run_bounded};
use crate::log::Redactor;

/// Diff flags that make the output independent of user configuration.
pub const DIFF_FLAGS: &[&str] = &[
    "--no-color",
    "--no-ext-diff",
    "--no-textconv",
    "--no-renames",
    "--full-index",
    "--binary",
    "--src-prefix=a/",
    "--dst-prefix=b/",
];

/// Errors from producing a preview.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PreviewError {
    /// A commit reference failed validation.
    #[error("invalid commit ref: {0}")]
    InvalidCommitRef(String),

    /// The git invocation failed.
    #[error("git failed: {0}")]
    Git(String),

    /// The subprocess could not be run.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Validates a commit reference before it is passed to git.
///
/// Rejects empty refs, refs starting with `-` (option injection), NUL
/// bytes, `..` ranges, and characters outside
/// `[A-Za-z0-9-_/.~^]`.
///
/// # Errors
///
/// Returns [`PreviewError::InvalidCommitRef`] describing the problem.
pub fn validate_commit_ref(commit_ref: &str) -> Result<(), PreviewError> {
    if commit_ref.is_empty() {
        return Err(PreviewError::InvalidCommitRef(
            "commit ref cannot be empty".to_string(),
        ));
    }
    if commit_ref.starts_with('-') {
        return Err(PreviewError::InvalidCommitRef(format!(
            "commit ref cannot start with '-': {commit_ref}"
        )));
    }
    if commit_ref.contains('\0') {
        return Err(PreviewError::InvalidCommitRef(
            "commit ref contains a NUL byte".to_string(),
        ));
    }
    if commit_ref.contains("..") {
        return Err(PreviewError::InvalidCommitRef(format!(
            "commit ref cannot be a range: {commit_ref}"
        )));
    }
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | '~' | '^');
    if !commit_ref.chars().all(valid) {
        return Err(PreviewError::InvalidCommitRef(format!(
            "commit ref contains invalid characters: {commit_ref}"
        )));
    }
    Ok(())
}

/// Produces the diff an approved merge would apply.
pub trait MergePreview: Send + Sync {
    /// Returns the diff bytes of `base...head`. Equal inputs must yield
    /// byte-identical output.
    ///
    /// # Errors
    ///
    /// Returns an error when the diff cannot be produced.
    fn diff(&self, base: &str, head: &str) -> Result<Vec<u8>, PreviewError>;
}

/// [`MergePreview`] backed by `git diff base...head`.
#[derive(Debug, Clone)]
pub struct GitMergePreview {
    repo: PathBuf,
    timeout: Duration,
    redactor: Redactor,
}

impl GitMergePreview {
    /// Creates a preview over the repository at `repo`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            timeout,
            redactor: Redactor::new(),
        }
    }

    /// Repository root.
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }
}

impl MergePreview for GitMergePreview {
    fn diff(&self, base: &str, head: &str) -> Result<Vec<u8>, PreviewError> {
        validate_commit_ref(base)?;
        validate_commit_ref(head)?;

        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo)
            .args(["-c", "core.quotepath=on", "diff"])
            .args(DIFF_FLAGS)
            .arg(format!("{base}...{head}"))
            .arg("--");
        let output = run_bounded(cmd, self.timeout)?;
        if !output.success() {
            return Err(PreviewError::Git(
                self.redactor.redact_captured(&output.stderr_lossy()),
            ));
        }
        Ok(output.stdout)
    }
}
