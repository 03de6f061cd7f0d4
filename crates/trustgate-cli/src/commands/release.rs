//! Release commands: `evaluate`, `rollback_simulation`, `publish_audit`
//! and `verify_audit`.
//!
//! A rejected candidate, a failed drill and a bundle that does not verify
//! all exit with [`exit_codes::FAILURE`] after printing the reason code.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use trustgate_core::release::{
    ApprovalState, MergeApproval, MergeCandidate, ReleaseController, RollbackSimulationResult,
    verify_audit_file,
};

use super::{Context, exit_codes, report_error, to_json};

/// Arguments for `trustgate evaluate`.
#[derive(Debug, Args)]
pub struct EvaluateArgs {
    /// Candidate id.
    #[arg(long)]
    pub candidate_id: String,

    /// Workflow that produced the change.
    #[arg(long = "workflow")]
    pub workflow_id: String,

    /// Agent that produced the change.
    #[arg(long = "agent")]
    pub agent_id: Option<String>,

    /// Merge base ref.
    #[arg(long)]
    pub base: String,

    /// Candidate head ref.
    #[arg(long)]
    pub head: String,

    /// Confidence score in [0, 1].
    #[arg(long)]
    pub confidence: f64,

    /// Git repository holding both refs.
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Print the decision as JSON.
    #[arg(long)]
    pub json: bool,
}

impl EvaluateArgs {
    fn candidate(&self) -> MergeCandidate {
        MergeCandidate {
            candidate_id: self.candidate_id.clone(),
            workflow_id: self.workflow_id.clone(),
            agent_id: self.agent_id.clone(),
            base: self.base.clone(),
            head: self.head.clone(),
            confidence: self.confidence,
        }
    }
}

/// Arguments for `trustgate rollback_simulation`.
#[derive(Debug, Args)]
pub struct RollbackArgs {
    /// Commit to roll back to (defaults to `HEAD~1`).
    #[arg(long)]
    pub commit: Option<String>,

    /// Skip unless the configured drill interval has elapsed.
    #[arg(long)]
    pub if_due: bool,

    /// Git repository to drill.
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `trustgate publish_audit`.
#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Release commit recorded in the metadata.
    #[arg(long)]
    pub commit: Option<String>,
}

/// Arguments for `trustgate verify_audit`.
#[derive(Debug, Args)]
pub struct VerifyAuditArgs {
    /// Bundle file to check.
    pub bundle: PathBuf,
}

fn controller(ctx: &Context, repo: &Path) -> Result<ReleaseController> {
    let ledger = ctx.open_ledger()?;
    ReleaseController::with_git(repo, &ctx.config, ledger, ctx.scorekeeper()?)
        .context("invalid release configuration")
}

/// Gates a merge candidate.
pub fn run_evaluate(args: &EvaluateArgs, config_path: Option<&Path>) -> u8 {
    evaluate(args, config_path).unwrap_or_else(|err| report_error(&err))
}

fn evaluate(args: &EvaluateArgs, config_path: Option<&Path>) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let approval = controller(&ctx, &args.repo)?
        .evaluate(&args.candidate())
        .context("gate evaluation failed")?;

    if args.json {
        println!("{}", to_json(&approval));
    } else {
        println!("{}", describe_approval(&approval));
    }
    Ok(if approval.state == ApprovalState::Approved {
        exit_codes::SUCCESS
    } else {
        exit_codes::FAILURE
    })
}

fn describe_approval(approval: &MergeApproval) -> String {
    match (approval.state, approval.reason) {
        (ApprovalState::Approved, _) => format!(
            "{} approved diff={}",
            approval.candidate_id,
            approval.diff_artifact_hash.as_deref().unwrap_or("-")
        ),
        (state, Some(reason)) => format!(
            "{} {state} reason={reason}{}",
            approval.candidate_id,
            approval
                .detail
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default()
        ),
        (state, None) => format!("{} {state}", approval.candidate_id),
    }
}

/// Runs one rollback drill.
pub fn run_rollback(args: &RollbackArgs, config_path: Option<&Path>) -> u8 {
    rollback(args, config_path).unwrap_or_else(|err| report_error(&err))
}

fn rollback(args: &RollbackArgs, config_path: Option<&Path>) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let controller = controller(&ctx, &args.repo)?;

    if args.if_due && !controller.drill_due().context("failed to read drill schedule")? {
        println!(
            "rollback drill not due (interval {}h)",
            ctx.config.rollback.interval_hours
        );
        return Ok(exit_codes::SUCCESS);
    }

    let result = controller
        .simulate_rollback(args.commit.as_deref())
        .context("rollback drill could not be recorded")?;
    if args.json {
        println!("{}", to_json(&result));
    } else {
        println!("{}", describe_drill(&result));
    }
    if result.success {
        Ok(exit_codes::SUCCESS)
    } else {
        eprintln!("Error: RollbackSimulationFailure");
        Ok(exit_codes::FAILURE)
    }
}

fn describe_drill(result: &RollbackSimulationResult) -> String {
    let outcome = if result.success { "passed" } else { "FAILED" };
    let mut line = format!(
        "rollback {} -> {} {outcome} in {}ms",
        result.commit_from, result.commit_to, result.duration
    );
    if let Some(error) = &result.error {
        line.push_str(": ");
        line.push_str(error);
    }
    line
}

/// Publishes a signed audit bundle.
pub fn run_publish(args: &PublishArgs, config_path: Option<&Path>) -> u8 {
    publish(args, config_path).unwrap_or_else(|err| report_error(&err))
}

fn publish(args: &PublishArgs, config_path: Option<&Path>) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    // Publishing never touches git.
    let published = controller(&ctx, Path::new("."))?
        .publish_audit_bundle(args.commit.as_deref())
        .context("audit bundle publishing failed")?;
    println!("bundle: {}", published.path.display());
    println!("signature: {}", published.signature_path.display());
    println!("checksum: {}", published.bundle.checksum);
    Ok(exit_codes::SUCCESS)
}

/// Checks a bundle's checksum and signature.
pub fn run_verify_audit(args: &VerifyAuditArgs, config_path: Option<&Path>) -> u8 {
    let ctx = match Context::load(config_path) {
        Ok(ctx) => ctx,
        Err(err) => return report_error(&err),
    };
    match verify_audit_file(&args.bundle, &ctx.signer) {
        Ok(bundle) => {
            println!(
                "audit bundle verified: version {} checksum {}",
                bundle.release_metadata.version, bundle.checksum
            );
            exit_codes::SUCCESS
        },
        Err(err) => {
            tracing::warn!(
                path = %args.bundle.display(),
                reason = err.code(),
                "audit bundle failed verification"
            );
            eprintln!("Error: AuditBundleVerificationFailure({}): {err}", err.code());
            exit_codes::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use trustgate_core::release::RejectionReason;

    use super::*;

    #[test]
    fn rejection_prints_reason_code() {
        let mut approval = MergeApproval::pending("cand-1", "wf-1", Some("agent-a"));
        approval
            .reject(RejectionReason::LowTrust, Some("trust -1.20 < 0.00".to_string()), 5)
            .unwrap();
        assert_eq!(
            describe_approval(&approval),
            "cand-1 rejected reason=LowTrust (trust -1.20 < 0.00)"
        );
    }

    #[test]
    fn failed_drill_carries_its_error() {
        let result = RollbackSimulationResult {
            commit_from: "aaa".to_string(),
            commit_to: "bbb".to_string(),
            success: false,
            duration: 12,
            error: Some("cargo test exited with 101".to_string()),
        };
        assert_eq!(
            describe_drill(&result),
            "rollback aaa -> bbb FAILED in 12ms: cargo test exited with 101"
        );
    }
}
