//! End-to-end flow: runs are scored into trust history, candidates are
//! gated on it, drills and audit bundles land in the same ledger, and the
//! whole chain verifies afterwards.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use trustgate_core::config::TrustGateConfig;
use trustgate_core::crypto::{ContentHasher, Signer, SigningSecret};
use trustgate_core::ledger::{
    EntryKind, EvidenceLedger, LedgerVerifier, VerificationStatus, VerifyFilter, read_entries,
};
use trustgate_core::log::Redactor;
use trustgate_core::release::{
    ApprovalState, AuditConfig, GateConfig, GitMergePreview, GitWorktreeCheckout, MergeCandidate,
    MergePreview, PreviewError, RejectionReason, ReleaseController, RollbackConfig,
    RollbackSimulator, TrustGate,
};
use trustgate_core::reward::{
    RewardScorekeeper, RewardWeights, RunOutcome, TaskRecord, TaskStatus, TrustPolicy, WorkflowRun,
};

struct StaticPreview;

impl MergePreview for StaticPreview {
    fn diff(&self, base: &str, head: &str) -> Result<Vec<u8>, PreviewError> {
        Ok(format!("diff {base}...{head}\n").into_bytes())
    }
}

fn signer() -> Signer {
    Signer::new(SigningSecret::from_bytes(vec![0x42; 32]).unwrap())
}

fn run(agent: &str, succeeded: usize, failed: usize, rollbacks: u32) -> WorkflowRun {
    let task = |i: usize, status: TaskStatus| TaskRecord {
        task_id: format!("t-{i}"),
        agent_id: Some(agent.to_string()),
        status,
        tokens_used: Some(100),
        output: None,
    };
    let mut tasks: Vec<_> = (0..succeeded).map(|i| task(i, TaskStatus::Succeeded)).collect();
    tasks.extend(
        (0..failed).map(|i| task(succeeded + i, TaskStatus::Failed { transient: false })),
    );
    WorkflowRun {
        workflow_id: format!("wf-{agent}"),
        agent_id: Some(agent.to_string()),
        tasks,
        outcome: RunOutcome {
            token_usage: None,
            token_budget: Some(2_000),
            rollbacks,
        },
    }
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn git(repo: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["-c", "user.name=Release Bot", "-c", "user.email=bot@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?}: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Repository with `main` (two commits) and a `feature` branch on top.
fn init_repo(dir: &Path) -> std::path::PathBuf {
    let repo = dir.join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-q"]);
    git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(repo.join("a.txt"), "one\n").unwrap();
    git(&repo, &["add", "a.txt"]);
    git(&repo, &["commit", "-q", "-m", "first"]);
    std::fs::write(repo.join("b.txt"), "two\n").unwrap();
    git(&repo, &["add", "b.txt"]);
    git(&repo, &["commit", "-q", "-m", "second"]);
    git(&repo, &["checkout", "-q", "-b", "feature"]);
    std::fs::write(repo.join("a.txt"), "one\nchanged\n").unwrap();
    git(&repo, &["commit", "-q", "-am", "change"]);
    git(&repo, &["checkout", "-q", "main"]);
    repo
}

#[test]
fn scored_history_gates_merges_and_everything_verifies() {
    let dir = TempDir::new().unwrap();
    let mut config = TrustGateConfig::default();
    config.storage.root = dir.path().join("storage");
    let sbom = dir.path().join("sbom.json");
    std::fs::write(&sbom, br#"{"components":[]}"#).unwrap();
    config.audit = AuditConfig {
        sbom_path: sbom,
        version: "0.9.0".to_string(),
    };

    let ledger = EvidenceLedger::open(config.storage.ledger_path(), signer()).unwrap();
    let keeper = Arc::new(
        RewardScorekeeper::new(
            config.reward.weights,
            config.reward.policy,
            config.storage.history_path(),
        )
        .unwrap(),
    );
    for _ in 0..3 {
        keeper.record(&ledger, &run("agent-good", 10, 0, 0)).unwrap();
    }
    for _ in 0..5 {
        keeper.record(&ledger, &run("agent-bad", 6, 4, 2)).unwrap();
    }

    let gate = TrustGate::new(
        GateConfig::default(),
        Arc::clone(&keeper),
        Arc::new(StaticPreview),
    )
    .unwrap();
    let rollback = RollbackSimulator::new(
        RollbackConfig::default(),
        Box::new(GitWorktreeCheckout::new(dir.path(), Duration::from_secs(5))),
        Redactor::new(),
    )
    .unwrap();
    let controller = ReleaseController::new(
        ledger,
        Arc::clone(&keeper),
        gate,
        rollback,
        config.audit.clone(),
        config.storage.audit_dir(),
    );

    let candidate = |agent: &str| MergeCandidate {
        candidate_id: format!("cand-{agent}"),
        workflow_id: format!("wf-{agent}"),
        agent_id: Some(agent.to_string()),
        base: "main".to_string(),
        head: "feature".to_string(),
        confidence: 0.93,
    };

    let mut good = controller.evaluate(&candidate("agent-good")).unwrap();
    assert_eq!(good.state, ApprovalState::Approved);
    assert_eq!(
        good.diff_artifact_hash.as_deref(),
        Some(ContentHasher::hash_hex(b"diff main...feature\n").as_str())
    );
    controller.record_merge(&mut good).unwrap();

    let bad = controller.evaluate(&candidate("agent-bad")).unwrap();
    assert_eq!(bad.state, ApprovalState::Rejected);
    assert_eq!(bad.reason, Some(RejectionReason::LowTrust));

    let published = controller.publish_audit_bundle(Some("abc123")).unwrap();
    let subjects: Vec<_> = published
        .bundle
        .trust_summary
        .iter()
        .map(|r| r.agent_id.as_str())
        .collect();
    assert_eq!(subjects, ["agent-bad", "agent-good"]);
    assert!(published.bundle.trust_summary[0].manual_approval_required);
    controller.verify_audit_bundle(&published.path).unwrap();

    let rows: Vec<_> = LedgerVerifier::new(
        controller.ledger().path(),
        Some(signer()),
        VerifyFilter::verify_all(),
    )
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();
    // genesis, 8 budget decisions, approval, merge, rejection, audit bundle
    assert_eq!(rows.len(), 13);
    assert!(rows.iter().all(|r| r.status == VerificationStatus::Verified));

    let kinds: Vec<_> = rows.iter().map(|r| r.entry.kind).collect();
    assert_eq!(kinds[0], EntryKind::Genesis);
    assert_eq!(kinds[9], EntryKind::Approval);
    assert_eq!(kinds[10], EntryKind::Approval);
    assert_eq!(kinds[11], EntryKind::Rejection);
    assert_eq!(kinds[12], EntryKind::AuditBundle);
    assert_eq!(rows[12].entry.reference, published.bundle.checksum);
}

#[test]
fn git_preview_is_deterministic() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let repo = init_repo(dir.path());
    let preview = GitMergePreview::new(&repo, Duration::from_secs(10));

    let first = preview.diff("main", "feature").unwrap();
    let second = preview.diff("main", "feature").unwrap();
    assert_eq!(first, second);
    let text = String::from_utf8(first).unwrap();
    assert!(text.starts_with("diff --git a/a.txt b/a.txt"), "{text}");
    assert!(text.contains("+changed"));

    assert!(matches!(
        preview.diff("main", "no-such-branch"),
        Err(PreviewError::Git(_))
    ));
}

#[cfg(unix)]
#[test]
fn git_rollback_drill_runs_in_scratch_worktree() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let repo = init_repo(dir.path());
    let ledger = EvidenceLedger::open(dir.path().join("ledger.jsonl"), signer()).unwrap();

    let config = RollbackConfig {
        commands: vec![vec![
            "sh".to_string(),
            "-c".to_string(),
            "test -f a.txt && test ! -f b.txt".to_string(),
        ]],
        command_timeout_ms: 10_000,
        scratch_dir: Some(dir.path().join("scratch")),
        ..RollbackConfig::default()
    };
    let simulator = RollbackSimulator::new(
        config,
        Box::new(GitWorktreeCheckout::new(&repo, Duration::from_secs(10))),
        Redactor::new(),
    )
    .unwrap();

    // HEAD~1 on main predates b.txt.
    let result = simulator.simulate(&ledger, None).unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.commit_from, git(&repo, &["rev-parse", "HEAD"]));
    assert_eq!(result.commit_to, git(&repo, &["rev-parse", "HEAD~1"]));

    // The operator's checkout is untouched and the worktree is gone.
    assert!(repo.join("b.txt").exists());
    assert_eq!(git(&repo, &["worktree", "list"]).lines().count(), 1);

    // Rolling back to HEAD itself keeps b.txt, so the command fails.
    let failed = simulator.simulate(&ledger, Some("HEAD")).unwrap();
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("exited with"));

    let drills: Vec<_> = read_entries(ledger.path())
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EntryKind::RollbackDrill)
        .collect();
    assert_eq!(drills.len(), 2);
    assert_eq!(drills[1].payload["success"], false);
}

#[test]
fn scorekeeper_configuration_flows_from_toml() {
    let config = TrustGateConfig::from_toml(
        r"
        [reward.policy]
        trend_window = 2
        trend_floor = -0.25
        ",
    )
    .unwrap();
    let dir = TempDir::new().unwrap();
    let keeper = RewardScorekeeper::new(
        config.reward.weights,
        config.reward.policy,
        dir.path().join("history.jsonl"),
    )
    .unwrap();
    assert_eq!(keeper.policy().trend_window, 2);
    assert_eq!(*keeper.weights(), RewardWeights::default());
    assert_ne!(*keeper.policy(), TrustPolicy::default());
}
