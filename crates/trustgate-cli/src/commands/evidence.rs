//! `trustgate evidence` subcommands.
//!
//! - `evidence show` lists entries, optionally verifying each one
//! - `evidence verify` walks the whole chain, resuming from a checkpoint
//! - `evidence append` records an arbitrary entry from a JSON payload file
//! - `evidence stage` records a stage receipt from a JSON leaf list
//! - `evidence stats` summarizes the ledger

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use trustgate_core::crypto::Signer;
use trustgate_core::ledger::{
    EntryKind, LedgerVerifier, StageLeaf, VerificationStatus, VerifiedEntry, VerifyCheckpoint,
    VerifyFilter, ledger_stats,
};

use super::{Context, exit_codes, load_config, read_bounded_file, report_error, to_json};

/// Evidence ledger command group.
#[derive(Debug, Args)]
pub struct EvidenceCommand {
    #[command(subcommand)]
    pub subcommand: EvidenceSubcommand,
}

/// Evidence subcommands.
#[derive(Debug, Subcommand)]
pub enum EvidenceSubcommand {
    /// List ledger entries, newest last.
    Show(ShowArgs),

    /// Verify the full chain, saving a checkpoint for the next run.
    Verify(VerifyArgs),

    /// Append an entry whose payload is read from a JSON file.
    Append(AppendArgs),

    /// Append a stage receipt whose reference is the Merkle root of its
    /// leaves.
    Stage(StageArgs),

    /// Print entry counts and the chain head.
    Stats(StatsArgs),
}

/// Arguments for `trustgate evidence show`.
#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Only entries for this workflow.
    #[arg(long = "workflow")]
    pub workflow_id: Option<String>,

    /// Only these kinds (comma separated).
    #[arg(long = "kind", value_delimiter = ',')]
    pub kinds: Vec<EntryKind>,

    /// Only entries at or after this timestamp (ms since epoch).
    #[arg(long)]
    pub since: Option<u64>,

    /// Only entries at or before this timestamp (ms since epoch).
    #[arg(long)]
    pub until: Option<u64>,

    /// Stop after this many entries.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Check hashes, chain links, Merkle roots and signatures.
    #[arg(long)]
    pub verify_signatures: bool,

    /// Print entries as JSON lines.
    #[arg(long)]
    pub json: bool,
}

impl ShowArgs {
    fn filter(&self) -> VerifyFilter {
        let mut filter = VerifyFilter {
            verify_signatures: self.verify_signatures,
            ..VerifyFilter::default()
        }
        .with_window(self.since, self.until);
        if let Some(workflow_id) = &self.workflow_id {
            filter = filter.with_workflow(workflow_id.clone());
        }
        if !self.kinds.is_empty() {
            filter = filter.with_kinds(self.kinds.iter().copied());
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        filter
    }
}

/// Arguments for `trustgate evidence verify`.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Start after the last saved checkpoint instead of genesis.
    #[arg(long)]
    pub resume: bool,
}

/// Arguments for `trustgate evidence append`.
#[derive(Debug, Args)]
pub struct AppendArgs {
    /// Entry kind.
    #[arg(long)]
    pub kind: EntryKind,

    /// JSON file holding the payload object.
    #[arg(long)]
    pub payload: PathBuf,

    /// Reference for kinds that do not derive one from the payload.
    #[arg(long)]
    pub reference: Option<String>,
}

/// Arguments for `trustgate evidence stage`.
#[derive(Debug, Args)]
pub struct StageArgs {
    /// Workflow the stage belongs to.
    #[arg(long = "workflow")]
    pub workflow_id: String,

    /// Stage name.
    #[arg(long)]
    pub stage: String,

    /// JSON file holding the ordered leaf array.
    #[arg(long)]
    pub leaves: PathBuf,
}

/// Arguments for `trustgate evidence stats`.
#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Print as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Runs an evidence subcommand and returns its exit code.
pub fn run_evidence(cmd: &EvidenceCommand, config_path: Option<&Path>) -> u8 {
    let result = match &cmd.subcommand {
        EvidenceSubcommand::Show(args) => run_show(args, config_path),
        EvidenceSubcommand::Verify(args) => run_verify(args, config_path),
        EvidenceSubcommand::Append(args) => run_append(args, config_path),
        EvidenceSubcommand::Stage(args) => run_stage(args, config_path),
        EvidenceSubcommand::Stats(args) => run_stats(args, config_path),
    };
    result.unwrap_or_else(|err| report_error(&err))
}

fn run_show(args: &ShowArgs, config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let ledger_path = config.storage.ledger_path();
    // Listing mode needs no key.
    let signer: Option<Signer> = if args.verify_signatures {
        Some(
            config
                .signing
                .signer()
                .context("--verify-signatures needs the signing secret")?,
        )
    } else {
        None
    };

    let mut verifier = LedgerVerifier::new(&ledger_path, signer, args.filter())
        .with_context(|| format!("failed to open ledger '{}'", ledger_path.display()))?;
    for row in verifier.by_ref() {
        let row = row.context("ledger read failed")?;
        if args.json {
            println!("{}", row_json(&row));
        } else {
            println!("{}", format_row(&row));
        }
    }

    let shown = verifier.failures();
    let hidden = verifier.failures_outside_filter();
    if shown + hidden > 0 {
        eprintln!(
            "WARNING: {shown} entries failed verification ({hidden} more outside the filter)"
        );
        return Ok(exit_codes::FAILURE);
    }
    Ok(exit_codes::SUCCESS)
}

fn run_verify(args: &VerifyArgs, config_path: Option<&Path>) -> Result<u8> {
    let ctx = Context::load(config_path)?;
    let ledger_path = ctx.ledger_path();
    let checkpoint_path = VerifyCheckpoint::path_for(&ledger_path);
    let filter = VerifyFilter::verify_all();

    let start = if args.resume {
        VerifyCheckpoint::load(&checkpoint_path).context("failed to load checkpoint")?
    } else {
        None
    };
    let resumed_at = start.as_ref().map_or(0, |c| c.entries);
    let mut verifier = match start {
        Some(checkpoint) => {
            LedgerVerifier::resume(&ledger_path, Some(ctx.signer.clone()), filter, checkpoint)
        },
        None => LedgerVerifier::new(&ledger_path, Some(ctx.signer.clone()), filter),
    }
    .with_context(|| format!("failed to open ledger '{}'", ledger_path.display()))?;

    let mut checked = 0u64;
    for row in verifier.by_ref() {
        let row = row.context("ledger read failed")?;
        checked += 1;
        if let VerificationStatus::Failed(failure) = &row.status {
            println!(
                "entry {} (offset {}, {}): {failure}",
                row.index, row.offset, row.entry.kind
            );
        }
    }

    if let Some(checkpoint) = verifier.checkpoint() {
        checkpoint
            .save(&checkpoint_path)
            .context("failed to save checkpoint")?;
    }

    let failures = verifier.failures();
    println!("checked {checked} entries after entry {resumed_at}, {failures} failed");
    if failures > 0 {
        eprintln!("WARNING: ledger integrity check failed; the ledger needs manual repair");
        return Ok(exit_codes::FAILURE);
    }
    Ok(exit_codes::SUCCESS)
}

fn run_append(args: &AppendArgs, config_path: Option<&Path>) -> Result<u8> {
    let content = read_bounded_file(&args.payload)?;
    let payload: serde_json::Value =
        serde_json::from_str(&content).context("payload is not valid JSON")?;
    if !payload.is_object() {
        bail!("payload must be a JSON object");
    }

    let ledger = Context::load(config_path)?.open_ledger()?;
    let entry = ledger
        .append_with_reference(args.kind, payload, args.reference.as_deref())
        .context("append failed")?;
    println!(
        "appended {} reference={} signature={}",
        entry.kind,
        entry.reference,
        entry.signature()
    );
    Ok(exit_codes::SUCCESS)
}

fn run_stage(args: &StageArgs, config_path: Option<&Path>) -> Result<u8> {
    let content = read_bounded_file(&args.leaves)?;
    let leaves: Vec<StageLeaf> =
        serde_json::from_str(&content).context("leaves file is not a JSON leaf array")?;

    let ledger = Context::load(config_path)?.open_ledger()?;
    let entry = ledger
        .append_stage_receipt(&args.workflow_id, &args.stage, leaves)
        .context("stage receipt rejected")?;
    println!("stage {} root={}", args.stage, entry.reference);
    Ok(exit_codes::SUCCESS)
}

fn run_stats(args: &StatsArgs, config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let stats = ledger_stats(&config.storage.ledger_path()).context("failed to read ledger")?;

    if args.json {
        let per_kind: serde_json::Map<_, _> = stats
            .per_kind
            .iter()
            .map(|(kind, count)| (kind.to_string(), serde_json::Value::from(*count)))
            .collect();
        let value = serde_json::json!({
            "entry_count": stats.entry_count,
            "per_kind": per_kind,
            "head_signature": stats.head_signature,
            "head_timestamp": stats.head_timestamp,
            "size_bytes": stats.size_bytes,
        });
        println!("{}", to_json(&value));
    } else {
        println!("Entries: {}", stats.entry_count);
        for (kind, count) in &stats.per_kind {
            println!("  {kind}: {count}");
        }
        println!("Head: {} at {}", stats.head_signature, stats.head_timestamp);
        println!("Size: {} bytes", stats.size_bytes);
    }
    Ok(exit_codes::SUCCESS)
}

fn signature_column(status: &VerificationStatus) -> String {
    match status {
        VerificationStatus::Verified => "signature=verified".to_string(),
        VerificationStatus::Unverified => "signature=unverified".to_string(),
        VerificationStatus::Failed(failure) => format!("signature=INVALID({})", failure.code()),
    }
}

fn format_row(row: &VerifiedEntry) -> String {
    let reference = if row.entry.reference.is_empty() {
        "-"
    } else {
        row.entry.reference.as_str()
    };
    format!(
        "{:>6} {} {:<16} {:<20} {} {}",
        row.index,
        row.entry.timestamp,
        row.entry.kind.as_str(),
        row.entry.workflow_id().unwrap_or("-"),
        reference,
        signature_column(&row.status)
    )
}

fn row_json(row: &VerifiedEntry) -> String {
    let status = match &row.status {
        VerificationStatus::Verified => "verified".to_string(),
        VerificationStatus::Unverified => "unverified".to_string(),
        VerificationStatus::Failed(failure) => failure.code().to_string(),
    };
    serde_json::json!({
        "index": row.index,
        "offset": row.offset,
        "status": status,
        "entry": row.entry,
    })
    .to_string()
}
