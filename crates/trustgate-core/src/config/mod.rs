//! Configuration parsing and management.
//!
//! `trustgate.toml` configures storage locations, where the signing secret
//! comes from, the reward weight table and trust policy, gate thresholds,
//! rollback drills and audit bundles. Every section is optional.
//!
//! ```toml
//! [storage]
//! root = "storage"
//!
//! [signing]
//! secret_env = "TRUSTGATE_SIGNING_SECRET"
//! secret_file = "/etc/trustgate/signing.key"
//!
//! [reward.weights]
//! rollback_penalty = -1.25
//!
//! [reward.policy]
//! trend_window = 5
//!
//! [gate]
//! confidence_threshold = 0.8
//! timeout_ms = 30000
//!
//! [rollback]
//! commands = [["cargo", "build", "--locked"], ["cargo", "test", "--locked"]]
//! interval_hours = 168
//!
//! [audit]
//! sbom_path = "sbom.json"
//! version = "1.4.0"
//! ```
//!
//! The secret itself is never read from this file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{Signer, SigningError, SigningSecret};
use crate::release::{AuditConfig, GateConfig, RollbackConfig};
use crate::reward::{RewardWeights, TrustPolicy};

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "trustgate.toml";

/// Environment variable consulted for the hex signing secret by default.
pub const DEFAULT_SECRET_ENV: &str = "TRUSTGATE_SIGNING_SECRET";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustGateConfig {
    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Signing secret source.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Reward weights and trust policy.
    #[serde(default)]
    pub reward: RewardConfig,

    /// Trust gate thresholds.
    #[serde(default)]
    pub gate: GateConfig,

    /// Rollback drills.
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Audit bundles.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl TrustGateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Loads `path` if it exists, otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed or
    /// validated.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The TOML is invalid
    /// - A literal `secret` key appears in `[signing]`
    /// - Any section fails validation
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if let Ok(raw) = content.parse::<toml::Table>() {
            let inline_secret = raw
                .get("signing")
                .and_then(toml::Value::as_table)
                .is_some_and(|signing| signing.contains_key("secret"));
            if inline_secret {
                return Err(ConfigError::Validation(
                    "the signing secret cannot be stored in the configuration file; \
                     use [signing] secret_env or secret_file"
                        .to_string(),
                ));
            }
        }
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reward
            .weights
            .validate()
            .map_err(|e| ConfigError::Validation(format!("[reward.weights] {e}")))?;
        self.reward
            .policy
            .validate()
            .map_err(|e| ConfigError::Validation(format!("[reward.policy] {e}")))?;
        self.gate
            .validate()
            .map_err(|e| ConfigError::Validation(format!("[gate] {e}")))?;
        self.rollback
            .validate()
            .map_err(|e| ConfigError::Validation(format!("[rollback] {e}")))?;
        Ok(())
    }
}

/// Storage locations, all derived from one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Storage root directory.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl StorageConfig {
    /// `<root>/db/evidence/ledger.jsonl`
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("db").join("evidence").join("ledger.jsonl")
    }

    /// `<root>/rewards/history.jsonl`
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.root.join("rewards").join("history.jsonl")
    }

    /// `<root>/audit`
    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

/// Where the signing secret is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Environment variable holding the hex secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// File holding the hex secret; used when the variable is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_file: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            secret_file: None,
        }
    }
}

impl SigningConfig {
    /// Loads the secret: the environment variable first, then the file.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Unavailable`] when neither source is set, or
    /// the decoding error of the source that was used.
    pub fn load_secret(&self) -> Result<SigningSecret, SigningError> {
        match SigningSecret::from_env(&self.secret_env) {
            Err(SigningError::Unavailable(_)) => {},
            other => return other,
        }
        match &self.secret_file {
            Some(path) => SigningSecret::from_file(path),
            None => Err(SigningError::Unavailable(format!(
                "set {} or [signing] secret_file",
                self.secret_env
            ))),
        }
    }

    /// Loads the secret and wraps it in a [`Signer`].
    ///
    /// # Errors
    ///
    /// See [`SigningConfig::load_secret`].
    pub fn signer(&self) -> Result<Signer, SigningError> {
        self.load_secret().map(Signer::new)
    }
}

fn default_secret_env() -> String {
    DEFAULT_SECRET_ENV.to_string()
}

/// Reward weight table and trust policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardConfig {
    /// Metric targets and weights.
    #[serde(default)]
    pub weights: RewardWeights,

    /// Manual-gate thresholds.
    #[serde(default)]
    pub policy: TrustPolicy,
}

/// Configuration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
