//! trustgate-core - evidence ledger, reward scorekeeping and trust-gated
//! release control.
//!
//! The crate is organised around three components:
//!
//! - [`ledger`]: the append-only, hash-chained, HMAC-signed evidence ledger
//!   with Merkle stage receipts, per-kind mirror logs and streaming,
//!   checkpointed verification
//! - [`reward`]: scoring of workflow runs into reward deltas and replay of
//!   those deltas into per-agent trust records with a hysteresis gate
//! - [`release`]: the trust gate for autonomous merges, rollback drills in
//!   scratch worktrees, and signed audit bundles
//!
//! Supporting modules: [`config`] (TOML configuration), [`crypto`] (SHA-256,
//! HMAC-SHA256, constant-time comparison) and [`log`] (redaction of
//! captured command output).

pub mod config;
pub mod crypto;
pub mod ledger;
pub mod log;
pub mod release;
pub mod reward;
