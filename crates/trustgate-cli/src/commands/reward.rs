//! `trustgate reward_report`, `record_run` and `rebuild_history`.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Args;
use trustgate_core::reward::{AgentTrustRecord, WorkflowRun};

use super::{Context, exit_codes, load_config, read_bounded_file, report_error, to_json};

/// Arguments for `trustgate reward_report`.
#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Print as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `trustgate record_run`.
#[derive(Debug, Args)]
pub struct RecordRunArgs {
    /// JSON file describing the completed run.
    pub run: PathBuf,

    /// Print the delta as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Prints per-agent cumulative score, trend and manual-approval flags.
pub fn run_report(args: &ReportArgs, config_path: Option<&Path>) -> u8 {
    report(args, config_path).unwrap_or_else(|err| report_error(&err))
}

fn report(args: &ReportArgs, config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let keeper = trustgate_core::reward::RewardScorekeeper::new(
        config.reward.weights,
        config.reward.policy,
        config.storage.history_path(),
    )
    .context("invalid reward configuration")?;
    let records = keeper
        .trust_records()
        .context("failed to read reward history")?;

    if args.json {
        println!("{}", to_json(&records));
    } else {
        print!("{}", format_report(&records));
    }
    Ok(exit_codes::SUCCESS)
}

fn format_report(records: &[AgentTrustRecord]) -> String {
    use std::fmt::Write as _;

    if records.is_empty() {
        return "No reward history.\n".to_string();
    }
    let mut out = format!(
        "{:<24} {:>6} {:>12} {:>10}  {}\n",
        "AGENT", "RUNS", "CUMULATIVE", "TREND", "MANUAL"
    );
    for record in records {
        let _ = writeln!(
            out,
            "{:<24} {:>6} {:>12.3} {:>10.3}  {}",
            record.agent_id,
            record.runs,
            record.cumulative_score,
            record.trend,
            if record.manual_approval_required { "yes" } else { "no" }
        );
    }
    out
}

/// Scores a run, records it in the ledger and the history store.
pub fn run_record(args: &RecordRunArgs, config_path: Option<&Path>) -> u8 {
    record(args, config_path).unwrap_or_else(|err| report_error(&err))
}

fn record(args: &RecordRunArgs, config_path: Option<&Path>) -> Result<u8> {
    let content = read_bounded_file(&args.run)?;
    let run: WorkflowRun = serde_json::from_str(&content)
        .with_context(|| format!("'{}' is not a workflow run", args.run.display()))?;

    let ctx = Context::load(config_path)?;
    let ledger = ctx.open_ledger()?;
    let delta = ctx
        .scorekeeper()?
        .record(&ledger, &run)
        .context("failed to record reward delta")?;

    if args.json {
        println!("{}", to_json(&delta));
    } else {
        println!("{} {:+.3}", delta.subject(), delta.total);
    }
    Ok(exit_codes::SUCCESS)
}

/// Regenerates the history store from verified ledger entries.
pub fn run_rebuild(config_path: Option<&Path>) -> u8 {
    rebuild(config_path).unwrap_or_else(|err| report_error(&err))
}

fn rebuild(config_path: Option<&Path>) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let written = ctx
        .scorekeeper()?
        .rebuild_history_from_ledger(&ctx.ledger_path(), Some(ctx.signer.clone()))
        .context("history rebuild failed")?;
    println!("rebuilt reward history from {written} ledger entries");
    Ok(exit_codes::SUCCESS)
}
