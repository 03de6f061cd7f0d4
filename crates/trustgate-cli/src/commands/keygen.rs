//! `trustgate keygen`: writes a fresh signing secret.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::Args;
use trustgate_core::crypto::SigningSecret;

use super::{exit_codes, report_error};

/// Arguments for `trustgate keygen`.
#[derive(Debug, Args)]
pub struct KeygenArgs {
    /// Secret file to create (hex, mode 0600 on unix).
    #[arg(long, short)]
    pub output: PathBuf,

    /// Replace an existing file.
    #[arg(long)]
    pub force: bool,
}

/// Generates a secret and writes it to `--output`.
pub fn run_keygen(args: &KeygenArgs) -> u8 {
    keygen(args).unwrap_or_else(|err| report_error(&err))
}

fn keygen(args: &KeygenArgs) -> Result<u8> {
    write_secret(&args.output, args.force)?;
    println!("wrote signing secret to {}", args.output.display());
    println!("point [signing] secret_file at it, or export its contents as the secret env var");
    Ok(exit_codes::SUCCESS)
}

fn write_secret(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "'{}' already exists; pass --force to replace it (existing ledgers will stop verifying)",
            path.display()
        );
    }
    SigningSecret::generate()
        .context("failed to generate signing secret")?
        .write_to_file(path)
        .with_context(|| format!("failed to write '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret.hex");

        write_secret(&path, false).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        SigningSecret::from_file(&path).unwrap();

        assert!(write_secret(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);

        write_secret(&path, true).unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), first);
    }
}
