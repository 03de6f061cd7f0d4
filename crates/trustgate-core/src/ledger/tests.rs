//! Tests for ledger storage and verification.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

use super::*;
use crate::crypto::{ContentHasher, Signer, SigningSecret};

fn test_signer() -> Signer {
    Signer::new(SigningSecret::from_bytes(vec![0x42; 32]).expect("valid secret"))
}

/// Helper to create a temporary ledger for testing.
fn temp_ledger() -> (EvidenceLedger, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("evidence").join("ledger.jsonl");
    let ledger = EvidenceLedger::open(&path, test_signer()).expect("failed to open ledger");
    (ledger, dir)
}

fn leaves(n: u64) -> Vec<StageLeaf> {
    (0..n)
        .map(|i| {
            StageLeaf::from_output(
                i,
                format!("output-{i}").as_bytes(),
                ContentHasher::hash_hex(format!("task-{i}").as_bytes()),
                ContentHasher::hash_hex(format!("artifact-{i}").as_bytes()),
            )
        })
        .collect()
}

fn populate(ledger: &EvidenceLedger) {
    ledger
        .append(EntryKind::TaskDispatch, json!({"workflow_id": "wf-1", "task": "lint"}))
        .expect("append");
    ledger
        .append_stage_receipt("wf-1", "build", leaves(3))
        .expect("append stage");
    ledger
        .append(EntryKind::SecurityScan, json!({"workflow_id": "wf-2", "findings": 0}))
        .expect("append");
    ledger
        .append(EntryKind::AutoFixAction, json!({"workflow_id": "wf-1", "fix": "fmt"}))
        .expect("append");
}

fn verify_rows(path: &Path, filter: VerifyFilter) -> Vec<VerifiedEntry> {
    LedgerVerifier::new(path, Some(test_signer()), filter)
        .expect("open verifier")
        .collect::<Result<Vec<_>, _>>()
        .expect("verify")
}

fn statuses(path: &Path) -> Vec<VerificationStatus> {
    verify_rows(path, VerifyFilter::verify_all())
        .into_iter()
        .map(|row| row.status)
        .collect()
}

fn rewrite_lines(path: &Path, edit: impl FnOnce(&mut Vec<String>)) {
    let text = fs::read_to_string(path).expect("read ledger");
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    edit(&mut lines);
    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out).expect("write ledger");
}

fn edit_entry(line: &mut String, edit: impl FnOnce(&mut LedgerEntry)) {
    let mut entry = LedgerEntry::from_json_line(line).expect("parse entry");
    edit(&mut entry);
    *line = entry.to_json_line().expect("encode entry");
}

#[test]
fn test_open_creates_genesis() {
    let (ledger, _dir) = temp_ledger();

    let entries = ledger.entries().expect("read entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Genesis);
    assert_eq!(
        entries[0].signed_operation.previous_signature,
        ContentHasher::GENESIS_PREVIOUS_SIGNATURE
    );
    assert_eq!(entries[0].payload["schema"], LEDGER_SCHEMA);
}

#[test]
fn test_reopen_does_not_duplicate_genesis() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
        populate(&ledger);
    }
    let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
    assert_eq!(ledger.len().unwrap(), 5);

    let genesis_count = ledger
        .entries()
        .unwrap()
        .iter()
        .filter(|e| e.kind == EntryKind::Genesis)
        .count();
    assert_eq!(genesis_count, 1);
}

#[test]
fn test_append_chains_signatures() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);

    let entries = ledger.entries().unwrap();
    assert_eq!(entries.len(), 5);
    for pair in entries.windows(2) {
        assert_eq!(
            pair[1].signed_operation.previous_signature,
            pair[0].signed_operation.signature
        );
        assert!(pair[1].timestamp >= pair[0].timestamp);
    }
    assert_eq!(
        ledger.head_signature().unwrap(),
        entries[4].signed_operation.signature
    );
}

#[test]
fn test_record_binds_reference_and_hash() {
    let (ledger, _dir) = temp_ledger();
    let entry = ledger
        .append_with_reference(EntryKind::TaskDispatch, json!({"task": "t"}), Some("ticket-9"))
        .unwrap();

    assert_eq!(entry.reference, "ticket-9");
    assert_eq!(entry.recompute_record().unwrap(), entry.signed_operation.record);
    assert_eq!(
        entry.signed_operation.hash,
        ContentHasher::hash_hex(entry.signed_operation.record.as_bytes())
    );
}

#[test]
fn test_stage_receipt_reference_is_merkle_root() {
    let (ledger, _dir) = temp_ledger();
    let leaves = leaves(5);
    let expected = stage_root_hex(&leaves).unwrap();

    let entry = ledger.append_stage_receipt("wf-1", "test", leaves).unwrap();
    assert_eq!(entry.reference, expected);
}

#[test]
fn test_empty_stage_receipt_rejected() {
    let (ledger, _dir) = temp_ledger();
    let err = ledger.append_stage_receipt("wf-1", "test", Vec::new()).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidPayload {
            kind: EntryKind::StageReceipt,
            ..
        }
    ));
    assert_eq!(ledger.len().unwrap(), 1);
}

#[test]
fn test_audit_bundle_reference_requires_checksum() {
    let (ledger, _dir) = temp_ledger();
    assert!(ledger.append(EntryKind::AuditBundle, json!({})).is_err());

    let entry = ledger
        .append(EntryKind::AuditBundle, json!({"checksum": "abc123"}))
        .unwrap();
    assert_eq!(entry.reference, "abc123");
}

#[test]
fn test_append_genesis_rejected() {
    let (ledger, _dir) = temp_ledger();
    let err = ledger.append(EntryKind::Genesis, json!({})).unwrap_err();
    assert!(matches!(err, LedgerError::GenesisAlreadyPresent));
}

#[test]
fn test_second_writer_is_locked() {
    let (ledger, _dir) = temp_ledger();
    let err = EvidenceLedger::open(ledger.path(), test_signer()).unwrap_err();
    assert!(matches!(err, LedgerError::Locked(_)));
}

#[test]
fn test_mirror_receives_same_line() {
    let (ledger, _dir) = temp_ledger();
    let entry = ledger
        .append(EntryKind::SecurityScan, json!({"findings": 2}))
        .unwrap();

    let mirror = fs::read_to_string(ledger.mirror_path(EntryKind::SecurityScan)).unwrap();
    assert_eq!(mirror, format!("{}\n", entry.to_json_line().unwrap()));

    let primary = fs::read_to_string(ledger.path()).unwrap();
    assert!(primary.ends_with(&mirror));
}

#[test]
fn test_append_fails_closed_when_mirror_unwritable() {
    let (ledger, _dir) = temp_ledger();
    let before = fs::read(ledger.path()).unwrap();

    fs::remove_dir_all(ledger.mirror_dir()).unwrap();
    fs::write(ledger.mirror_dir(), b"not a directory").unwrap();

    let err = ledger
        .append(EntryKind::SecurityScan, json!({"findings": 0}))
        .unwrap_err();
    assert!(matches!(err, LedgerError::Write { .. }));

    assert_eq!(fs::read(ledger.path()).unwrap(), before);
    assert_eq!(ledger.len().unwrap(), 1);

    // The writer keeps working once the mirror directory is restored.
    fs::remove_file(ledger.mirror_dir()).unwrap();
    fs::create_dir_all(ledger.mirror_dir()).unwrap();
    ledger
        .append(EntryKind::SecurityScan, json!({"findings": 0}))
        .unwrap();
    assert!(statuses(ledger.path()).iter().all(|s| *s == VerificationStatus::Verified));
}

#[test]
fn test_verify_clean_ledger() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);

    let statuses = statuses(ledger.path());
    assert_eq!(statuses.len(), 5);
    assert!(statuses.iter().all(|s| *s == VerificationStatus::Verified));
}

#[test]
fn test_reverification_is_idempotent() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    assert_eq!(statuses(ledger.path()), statuses(ledger.path()));
}

#[test]
fn test_tampered_payload_reports_hash_mismatch() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[3], |entry| {
            entry.payload = json!({"workflow_id": "wf-2", "findings": 7});
        });
    });

    let statuses = statuses(&path);
    assert!(matches!(
        statuses[3],
        VerificationStatus::Failed(VerificationFailure::HashMismatch { .. })
    ));
    assert_eq!(statuses[4], VerificationStatus::Verified);
}

#[test]
fn test_edited_record_text_reports_record_mismatch() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[1], |entry| {
            entry.signed_operation.record.push(' ');
        });
    });

    assert_eq!(
        statuses(&path)[1],
        VerificationStatus::Failed(VerificationFailure::RecordMismatch)
    );
}

#[test]
fn test_removed_entry_reports_chain_break() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        lines.remove(2);
    });

    let statuses = statuses(&path);
    assert_eq!(statuses.len(), 4);
    assert_eq!(statuses[1], VerificationStatus::Verified);
    assert!(matches!(
        statuses[2],
        VerificationStatus::Failed(VerificationFailure::ChainBreak { .. })
    ));
    assert_eq!(statuses[3], VerificationStatus::Verified);
}

#[test]
fn test_reordered_entries_report_chain_break() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| lines.swap(3, 4));

    let statuses = statuses(&path);
    assert!(statuses[3].is_failed());
    assert!(statuses[4].is_failed());
}

#[test]
fn test_missing_genesis_reported() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        lines.remove(0);
    });

    assert_eq!(
        statuses(&path)[0],
        VerificationStatus::Failed(VerificationFailure::MissingGenesis)
    );
}

#[test]
fn test_stage_receipt_with_wrong_root_reports_root_mismatch() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    // Re-hash the altered record so only the root check can catch it.
    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[2], |entry| {
            entry.reference = ContentHasher::hash_hex(b"forged root");
            let record = entry.recompute_record().unwrap();
            entry.signed_operation.hash = ContentHasher::hash_hex(record.as_bytes());
            entry.signed_operation.record = record;
        });
    });

    assert!(matches!(
        statuses(&path)[2],
        VerificationStatus::Failed(VerificationFailure::RootMismatch { .. })
    ));
}

#[test]
fn test_rehashed_forgery_reports_signature_invalid() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[4], |entry| {
            entry.payload = json!({"workflow_id": "wf-1", "fix": "forged"});
            let record = entry.recompute_record().unwrap();
            entry.signed_operation.hash = ContentHasher::hash_hex(record.as_bytes());
            entry.signed_operation.record = record;
        });
    });

    assert_eq!(
        statuses(&path)[4],
        VerificationStatus::Failed(VerificationFailure::SignatureInvalid)
    );
}

#[test]
fn test_wrong_secret_fails_every_signature() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);

    let other = Signer::new(SigningSecret::from_bytes(vec![0x43; 32]).unwrap());
    let rows: Vec<_> = LedgerVerifier::new(ledger.path(), Some(other), VerifyFilter::verify_all())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(rows.iter().all(|row| {
        row.status == VerificationStatus::Failed(VerificationFailure::SignatureInvalid)
    }));
}

#[test]
fn test_listing_mode_reports_unverified() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);

    let rows = verify_rows(ledger.path(), VerifyFilter::default());
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| row.status == VerificationStatus::Unverified));
}

#[test]
fn test_filters_select_rows() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path();

    let wf1 = verify_rows(path, VerifyFilter::verify_all().with_workflow("wf-1"));
    assert_eq!(wf1.len(), 3);
    assert!(wf1.iter().all(|row| row.entry.workflow_id() == Some("wf-1")));

    let scans = verify_rows(
        path,
        VerifyFilter::verify_all().with_kinds([EntryKind::SecurityScan, EntryKind::Genesis]),
    );
    assert_eq!(
        scans.iter().map(|row| row.index).collect::<Vec<_>>(),
        vec![0, 3]
    );

    let limited = verify_rows(path, VerifyFilter::verify_all().with_limit(2));
    assert_eq!(limited.len(), 2);

    let empty = verify_rows(path, VerifyFilter::verify_all().with_window(Some(0), Some(0)));
    assert!(empty.is_empty());

    let first_ts = ledger.entries().unwrap()[0].timestamp;
    let all = verify_rows(path, VerifyFilter::verify_all().with_window(Some(first_ts), None));
    assert_eq!(all.len(), 5);
}

#[test]
fn test_filtered_view_counts_hidden_failures() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    // Corrupt a wf-2 entry, then look only at wf-1.
    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[3], |entry| {
            entry.payload = json!({"workflow_id": "wf-2", "findings": 99});
        });
    });

    let mut verifier = LedgerVerifier::new(
        &path,
        Some(test_signer()),
        VerifyFilter::verify_all().with_workflow("wf-1"),
    )
    .unwrap();
    let rows: Vec<_> = verifier.by_ref().collect::<Result<_, _>>().unwrap();

    assert!(rows.iter().all(|row| row.status == VerificationStatus::Verified));
    assert_eq!(verifier.failures(), 0);
    assert_eq!(verifier.failures_outside_filter(), 1);
}

#[test]
fn test_torn_tail_is_truncated_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
        populate(&ledger);
    }
    let clean_len = fs::metadata(&path).unwrap().len();

    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(br#"{"kind":"security_scan","timestamp":"#);
    fs::write(&path, &bytes).unwrap();

    // Readers skip the unterminated line before recovery runs.
    assert_eq!(read_entries(&path).unwrap().len(), 5);

    let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
    assert_eq!(ledger.len().unwrap(), 5);
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

    ledger.append(EntryKind::SecurityScan, json!({})).unwrap();
    assert!(statuses(&path).iter().all(|s| *s == VerificationStatus::Verified));
}

#[test]
fn test_corrupt_middle_line_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
        populate(&ledger);
    }
    rewrite_lines(&path, |lines| lines[2] = "{not json".to_string());

    let err = EvidenceLedger::open(&path, test_signer()).unwrap_err();
    assert!(matches!(err, LedgerError::CorruptLedger { line: 3, .. }));
}

#[test]
fn test_corrupt_terminated_last_line_is_kept() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let ledger = EvidenceLedger::open(&path, test_signer()).unwrap();
        populate(&ledger);
    }
    rewrite_lines(&path, |lines| {
        let last = lines.last_mut().unwrap();
        *last = last.replacen("\"kind\"", "\"kind\"::", 1);
    });
    let tampered = fs::read(&path).unwrap();

    let err = EvidenceLedger::open(&path, test_signer()).unwrap_err();
    assert!(matches!(err, LedgerError::CorruptLedger { line: 5, .. }));
    assert_eq!(fs::read(&path).unwrap(), tampered);
}

#[test]
fn test_stats_counts_kinds() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);

    let stats = ledger.stats().unwrap();
    assert_eq!(stats.entry_count, 5);
    assert_eq!(stats.per_kind[&EntryKind::Genesis], 1);
    assert_eq!(stats.per_kind[&EntryKind::StageReceipt], 1);
    assert_eq!(stats.head_signature, ledger.head_signature().unwrap());
    assert_eq!(stats.size_bytes, fs::metadata(ledger.path()).unwrap().len());
}

#[test]
fn test_checkpoint_resume_only_walks_new_entries() {
    let (ledger, dir) = temp_ledger();
    populate(&ledger);

    let mut verifier =
        LedgerVerifier::new(ledger.path(), Some(test_signer()), VerifyFilter::verify_all())
            .unwrap();
    assert_eq!(verifier.by_ref().count(), 5);
    let checkpoint = verifier.checkpoint().cloned().unwrap();
    assert_eq!(checkpoint.entries, 5);
    assert_eq!(checkpoint.last_signature, ledger.head_signature().unwrap());

    let checkpoint_path = dir.path().join("verify.checkpoint.json");
    checkpoint.save(&checkpoint_path).unwrap();
    let loaded = VerifyCheckpoint::load(&checkpoint_path).unwrap().unwrap();
    assert_eq!(loaded, checkpoint);

    ledger
        .append(EntryKind::RollbackDrill, json!({"success": true}))
        .unwrap();

    let rows: Vec<_> = LedgerVerifier::resume(
        ledger.path(),
        Some(test_signer()),
        VerifyFilter::verify_all(),
        loaded,
    )
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].index, 5);
    assert_eq!(rows[0].status, VerificationStatus::Verified);
}

#[test]
fn test_checkpoint_stops_at_first_failure() {
    let (ledger, _dir) = temp_ledger();
    populate(&ledger);
    let path = ledger.path().to_path_buf();
    drop(ledger);

    rewrite_lines(&path, |lines| {
        edit_entry(&mut lines[2], |entry| entry.timestamp += 1);
    });

    let mut verifier =
        LedgerVerifier::new(&path, Some(test_signer()), VerifyFilter::verify_all()).unwrap();
    verifier.by_ref().for_each(drop);
    assert_eq!(verifier.checkpoint().unwrap().entries, 2);
}

#[test]
fn test_checkpoint_off_line_boundary_rejected() {
    let (ledger, _dir) = temp_ledger();
    let checkpoint = VerifyCheckpoint {
        entries: 1,
        byte_offset: 3,
        last_signature: String::new(),
    };
    let err = LedgerVerifier::resume(ledger.path(), None, VerifyFilter::verify_all(), checkpoint)
        .unwrap_err();
    assert!(matches!(err, LedgerError::CheckpointMismatch(_)));
}

#[test]
fn test_missing_checkpoint_loads_as_none() {
    let dir = TempDir::new().unwrap();
    assert!(VerifyCheckpoint::load(&dir.path().join("absent.json")).unwrap().is_none());
}

#[test]
fn test_concurrent_appends_stay_chained() {
    let (ledger, _dir) = temp_ledger();
    let ledger = Arc::new(ledger);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for i in 0..10 {
                    ledger
                        .append(
                            EntryKind::TaskDispatch,
                            json!({"workflow_id": format!("wf-{t}"), "task": i}),
                        )
                        .expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let statuses = statuses(ledger.path());
    assert_eq!(statuses.len(), 41);
    assert!(statuses.iter().all(|s| *s == VerificationStatus::Verified));
    assert_eq!(
        fs::read_to_string(ledger.mirror_path(EntryKind::TaskDispatch))
            .unwrap()
            .lines()
            .count(),
        40
    );
}

#[test]
fn test_float_payloads_survive_reverification() {
    let (ledger, _dir) = temp_ledger();
    ledger
        .append(
            EntryKind::BudgetDecision,
            json!({"total": -3.034_926_470_588_235_5, "ratio": 0.1, "big": 1e21}),
        )
        .unwrap();
    assert!(statuses(ledger.path()).iter().all(|s| *s == VerificationStatus::Verified));
}

fn payload_strategy() -> impl Strategy<Value = Value> {
    (any::<u32>(), "[a-z]{0,12}", any::<bool>())
        .prop_map(|(n, s, b)| json!({"n": n, "s": s, "flag": b, "nested": {"k": [n, b]}}))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_untampered_ledger_always_verifies(payloads in prop::collection::vec(payload_strategy(), 1..12)) {
        let (ledger, _dir) = temp_ledger();
        for payload in payloads {
            ledger.append(EntryKind::SecurityScan, payload).unwrap();
        }
        let statuses = statuses(ledger.path());
        prop_assert!(statuses.iter().all(|s| *s == VerificationStatus::Verified));
    }

    #[test]
    fn prop_stage_receipt_root_matches_reference(n in 1u64..20) {
        let (ledger, _dir) = temp_ledger();
        let entry = ledger.append_stage_receipt("wf", "stage", leaves(n)).unwrap();
        let receipt: StageReceipt = serde_json::from_value(entry.payload.clone()).unwrap();
        prop_assert_eq!(stage_root_hex(&receipt.leaves).unwrap(), entry.reference);
    }
}
