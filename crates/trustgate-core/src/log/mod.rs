//! Log hygiene helpers.
//!
//! Structured logging itself goes through `tracing`; this module holds the
//! redaction applied to captured command output before it is logged or
//! written to the ledger.

mod redact;

pub use redact::{MAX_CAPTURED_CHARS, REDACTED, Redactor, redact};
