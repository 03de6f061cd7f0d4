//! Fuzz harness for ledger line parsing and record recomputation.
//!
//! Any line a reader can pull off disk must parse or fail cleanly, and a
//! parsed entry must re-canonicalize and re-serialize without panicking.

#![no_main]
use libfuzzer_sys::fuzz_target;
use trustgate_core::crypto::ContentHasher;
use trustgate_core::ledger::{LedgerEntry, derive_reference};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(entry) = LedgerEntry::from_json_line(line) else {
        return;
    };

    if let Ok(record) = entry.recompute_record() {
        let _ = ContentHasher::hash_hex(record.as_bytes());
    }
    let _ = derive_reference(entry.kind, &entry.payload, Some(&entry.reference));
    let _ = entry.workflow_id();

    // A parsed entry always serializes back to a single line.
    if let Ok(encoded) = entry.to_json_line() {
        assert!(!encoded.contains('\n'));
    }
});
