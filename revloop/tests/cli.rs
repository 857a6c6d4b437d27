use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use revloop::exit_codes;
use revloop::io::config::{CONFIG_DIR, CONFIG_FILE, LockConfig};
use revloop::io::lock::{Acquire, SessionInfo, SessionLock};
use revloop::test_support::{TestRepo, claude_transcript};

fn revloop(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_revloop"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .output()
        .expect("run revloop")
}

fn write_config(project: &Path, logs: &Path, extra: &str) {
    let dir = project.join(CONFIG_DIR);
    fs::create_dir_all(&dir).expect("config dir");
    let body = format!(
        "logs_root = \"{}\"\nmax_retries = 0\n{extra}",
        logs.display()
    );
    fs::write(dir.join(CONFIG_FILE), body).expect("config");
}

#[test]
fn extract_prints_decision_from_agent_transcript() {
    let temp = tempfile::tempdir().expect("tempdir");
    let text = "All good.\n<<<REVIEW_SUMMARY_START>>>\n{\"findings\":[],\"overall_correctness\":\"patch is correct\",\"overall_explanation\":\"ok\",\"overall_confidence_score\":0.8}\n<<<REVIEW_SUMMARY_END>>>";
    fs::write(temp.path().join("review.jsonl"), claude_transcript(text)).expect("write");

    let output = revloop(
        &["extract", "--role", "reviewer", "--agent", "claude", "review.jsonl"],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["source"], "delimited");
    assert_eq!(json["decision"]["kind"], "review");
}

#[test]
fn extract_failure_reports_reason() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("out.txt"), "no decision here").expect("write");

    let output = revloop(&["extract", "--role", "fixer", "out.txt"], temp.path());

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("delimited:"), "{stderr}");
}

#[test]
fn run_outside_git_repo_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = revloop(&["run", "--quiet"], temp.path());
    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not a git repository"));
}

#[test]
fn run_reports_busy_when_lock_is_held() {
    let repo = TestRepo::new().expect("repo");
    let logs = tempfile::tempdir().expect("logs");
    write_config(repo.path(), logs.path(), "");
    let locks = SessionLock::new(logs.path(), LockConfig::default());
    let holder = SessionInfo {
        session_id: "holder".to_string(),
        session_name: "holder@main".to_string(),
        mode: "cycle".to_string(),
    };
    let _held = match locks
        .acquire(repo.path(), Some("main"), &holder)
        .expect("acquire")
    {
        Acquire::Acquired(handle) => handle,
        Acquire::Conflict(_) => panic!("unexpected conflict"),
    };

    let output = revloop(&["run", "--quiet"], repo.path());

    assert_eq!(output.status.code(), Some(exit_codes::BUSY));
    assert!(String::from_utf8_lossy(&output.stderr).contains("is busy"));
}

#[test]
fn run_with_missing_agent_binary_fails_review() {
    let repo = TestRepo::new().expect("repo");
    let logs = tempfile::tempdir().expect("logs");
    write_config(
        repo.path(),
        logs.path(),
        "\n[reviewer]\nagent = \"claude\"\ncommand = \"revloop-no-such-agent\"\n",
    );

    let output = revloop(&["run", "--quiet"], repo.path());

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("review phase failed after 1 attempt(s)"), "{stdout}");
    assert!(stdout.contains("session log:"));
}

#[test]
fn init_refuses_to_overwrite() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = revloop(&["init"], temp.path());
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(CONFIG_DIR).join(CONFIG_FILE).exists());

    let second = revloop(&["init"], temp.path());
    assert_eq!(second.status.code(), Some(exit_codes::FAILED));
    let forced = revloop(&["init", "--force"], temp.path());
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn locks_lists_nothing_for_empty_root() {
    let logs = tempfile::tempdir().expect("logs");
    let root = logs.path().to_string_lossy().to_string();
    let output = revloop(&["locks", "--logs-root", &root], logs.path());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(output.stdout.is_empty());
}

#[test]
fn locks_uses_configured_staleness() {
    let project = tempfile::tempdir().expect("project");
    let logs = tempfile::tempdir().expect("logs");
    let locks = SessionLock::new(logs.path(), LockConfig::default());
    let holder = SessionInfo {
        session_id: "slow-heartbeat".to_string(),
        session_name: "slow@main".to_string(),
        mode: "cycle".to_string(),
    };
    let held = match locks
        .acquire(project.path(), Some("main"), &holder)
        .expect("acquire")
    {
        Acquire::Acquired(handle) => handle,
        Acquire::Conflict(_) => panic!("unexpected conflict"),
    };
    // Age the heartbeat past the default threshold but inside the configured one.
    let raw = fs::read_to_string(held.path()).expect("lock");
    let mut record: serde_json::Value = serde_json::from_str(&raw).expect("json");
    let aged = chrono::Utc::now() - chrono::Duration::seconds(300);
    record["lastHeartbeat"] = serde_json::json!(aged);
    fs::write(held.path(), record.to_string()).expect("write lock");

    let root = logs.path().to_string_lossy().to_string();
    let default_view = revloop(&["locks", "--logs-root", &root], logs.path());
    assert_eq!(default_view.status.code(), Some(exit_codes::OK));
    assert!(default_view.stdout.is_empty());

    write_config(project.path(), logs.path(), "[lock]\nstale_after_secs = 3600\n");
    let configured = revloop(&["locks"], project.path());
    assert_eq!(configured.status.code(), Some(exit_codes::OK));
    assert!(
        String::from_utf8_lossy(&configured.stdout).contains("slow-heartbeat"),
        "{}",
        String::from_utf8_lossy(&configured.stderr)
    );
}
