//! Subcommand implementations.
//!
//! Every `run_*` entry point returns a process exit code:
//!
//! - 0: success
//! - 1: the operation ran and found a problem (failed verification, a
//!   rejected candidate, a failed drill)
//! - 2: the operation could not run (bad arguments, config, I/O)

pub mod evidence;
pub mod keygen;
pub mod release;
pub mod reward;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use trustgate_core::config::{DEFAULT_CONFIG_FILE, TrustGateConfig};
use trustgate_core::crypto::Signer;
use trustgate_core::ledger::EvidenceLedger;
use trustgate_core::reward::RewardScorekeeper;

/// Maximum size of JSON input files (4 MiB).
pub const MAX_INPUT_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Exit codes shared by every command.
pub mod exit_codes {
    /// Success exit code.
    pub const SUCCESS: u8 = 0;
    /// The command ran and reported a failure.
    pub const FAILURE: u8 = 1;
    /// The command could not run.
    pub const ERROR: u8 = 2;
}

/// Loads the configuration named on the command line.
///
/// The default path may be absent, in which case defaults apply; an explicit
/// path must exist.
pub fn load_config(path: Option<&Path>) -> Result<TrustGateConfig> {
    match path {
        Some(path) => TrustGateConfig::from_file(path)
            .with_context(|| format!("failed to load config '{}'", path.display())),
        None => TrustGateConfig::from_file_or_default(Path::new(DEFAULT_CONFIG_FILE))
            .with_context(|| format!("failed to load config '{DEFAULT_CONFIG_FILE}'")),
    }
}

/// Configuration plus the signing key, shared by commands that write.
pub struct Context {
    pub config: TrustGateConfig,
    pub signer: Signer,
}

impl Context {
    /// Loads the config and the signing secret it points at.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        let signer = config
            .signing
            .signer()
            .context("signing secret unavailable")?;
        Ok(Self { config, signer })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.config.storage.ledger_path()
    }

    /// Opens the evidence ledger, writing genesis on first use.
    pub fn open_ledger(&self) -> Result<EvidenceLedger> {
        let path = self.ledger_path();
        EvidenceLedger::open(&path, self.signer.clone())
            .with_context(|| format!("failed to open ledger '{}'", path.display()))
    }

    pub fn scorekeeper(&self) -> Result<Arc<RewardScorekeeper>> {
        let keeper = RewardScorekeeper::new(
            self.config.reward.weights,
            self.config.reward.policy,
            self.config.storage.history_path(),
        )
        .context("invalid reward configuration")?;
        Ok(Arc::new(keeper))
    }
}

/// Reads a file with a size cap.
pub fn read_bounded_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("failed to open file '{}'", path.display()))?;

    let mut content = String::new();
    file.take(MAX_INPUT_FILE_SIZE + 1)
        .read_to_string(&mut content)
        .with_context(|| format!("failed to read file '{}'", path.display()))?;

    if content.len() as u64 > MAX_INPUT_FILE_SIZE {
        bail!(
            "file '{}' exceeds maximum size limit of {MAX_INPUT_FILE_SIZE} bytes",
            path.display()
        );
    }
    Ok(content)
}

/// Prints the error chain and returns [`exit_codes::ERROR`].
pub fn report_error(err: &anyhow::Error) -> u8 {
    eprintln!("Error: {err:#}");
    exit_codes::ERROR
}

/// Pretty JSON for `--json` output.
pub fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}
