//! Fuzz harness for `verify_audit_bundle_bytes`.
//!
//! Arbitrary bytes must never verify under a fixed secret, and must never
//! panic the parser or the canonical re-encoding check.

#![no_main]
use libfuzzer_sys::fuzz_target;
use trustgate_core::crypto::{Signer, SigningSecret};
use trustgate_core::release::verify_audit_bundle_bytes;

fuzz_target!(|data: &[u8]| {
    let Ok(secret) = SigningSecret::from_bytes(vec![0x5a; 32]) else {
        return;
    };
    let signer = Signer::new(secret);

    // Forging a valid HMAC by chance is not a realistic fuzzer outcome.
    assert!(verify_audit_bundle_bytes(data, &signer).is_err());
});
