//! trustgate - trust-gated release integrity
//!
//! Operator CLI over the evidence ledger, the reward scorekeeper and the
//! release controller.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// trustgate - trust-gated release integrity
#[derive(Parser, Debug)]
#[command(name = "trustgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults to trustgate.toml when
    /// present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Evidence ledger ===
    /// Evidence ledger commands
    Evidence(commands::evidence::EvidenceCommand),

    // === Rewards and trust ===
    /// Print per-agent cumulative score, trend and manual-approval flags
    #[command(name = "reward_report")]
    RewardReport(commands::reward::ReportArgs),

    /// Score a completed workflow run and record it
    #[command(name = "record_run")]
    RecordRun(commands::reward::RecordRunArgs),

    /// Rebuild the reward history store from the ledger
    #[command(name = "rebuild_history")]
    RebuildHistory,

    // === Release control ===
    /// Gate a merge candidate on confidence and trust
    Evaluate(commands::release::EvaluateArgs),

    /// Drill a rollback in a scratch worktree
    #[command(name = "rollback_simulation")]
    RollbackSimulation(commands::release::RollbackArgs),

    /// Publish a signed audit bundle
    #[command(name = "publish_audit")]
    PublishAudit(commands::release::PublishArgs),

    /// Verify an audit bundle's checksum and signature
    #[command(name = "verify_audit")]
    VerifyAudit(commands::release::VerifyAuditArgs),

    // === Keys ===
    /// Generate a signing secret
    Keygen(commands::keygen::KeygenArgs),
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = cli.config.as_deref();
    // Exit codes: 0=success, 1=failure reported, 2=could not run.
    let exit_code = match &cli.command {
        Commands::Evidence(cmd) => commands::evidence::run_evidence(cmd, config),
        Commands::RewardReport(args) => commands::reward::run_report(args, config),
        Commands::RecordRun(args) => commands::reward::run_record(args, config),
        Commands::RebuildHistory => commands::reward::run_rebuild(config),
        Commands::Evaluate(args) => commands::release::run_evaluate(args, config),
        Commands::RollbackSimulation(args) => commands::release::run_rollback(args, config),
        Commands::PublishAudit(args) => commands::release::run_publish(args, config),
        Commands::VerifyAudit(args) => commands::release::run_verify_audit(args, config),
        Commands::Keygen(args) => commands::keygen::run_keygen(args),
    };
    std::process::exit(i32::from(exit_code));
}
