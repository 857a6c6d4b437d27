//! Test-only fakes for the cycle engine's seams, plus a throwaway git repo.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::decision::FixDecision;
use crate::core::types::Role;
use crate::io::agent::{AgentRequest, AgentRun, AgentRunner};
use crate::io::git::{CheckpointHandle, Checkpointer};
use crate::io::process::CancelFlag;
use crate::io::verify::{VerifyOutcome, VerifyRequest, Verifier};

/// Temporary git repository on branch `main` with one commit (`README.md`).
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "revloop@example.com"])?;
        repo.git(&["config", "user.name", "revloop tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "hi\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-q", "-m", "init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn branch(&self) -> &str {
        "main"
    }

    /// Run git in the repo and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// What a scripted agent does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Exit with `exit_code`, emitting `text` as the final result.
    Respond { text: String, exit_code: i32, stderr: String },
    /// Fail to spawn.
    SpawnError(String),
    /// Trip the cancel flag, as Ctrl-C would mid-run.
    Cancel,
}

/// One expected agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub role: Role,
    pub behavior: Behavior,
    /// Files written into the workdir before the run returns.
    pub writes: Vec<(String, String)>,
}

impl ScriptedRun {
    /// Successful run whose final text carries `decision` between the role's delimiters.
    pub fn decision(role: Role, decision: Value) -> Self {
        let (start, end) = role.delimiters();
        Self::text(role, &format!("Done.\n{start}\n{decision}\n{end}"))
    }

    /// Successful run with arbitrary final text.
    pub fn text(role: Role, text: &str) -> Self {
        Self {
            role,
            behavior: Behavior::Respond {
                text: text.to_string(),
                exit_code: 0,
                stderr: String::new(),
            },
            writes: Vec::new(),
        }
    }

    pub fn exit(role: Role, exit_code: i32, stderr: &str) -> Self {
        Self {
            role,
            behavior: Behavior::Respond {
                text: String::new(),
                exit_code,
                stderr: stderr.to_string(),
            },
            writes: Vec::new(),
        }
    }

    pub fn spawn_error(role: Role, message: &str) -> Self {
        Self {
            role,
            behavior: Behavior::SpawnError(message.to_string()),
            writes: Vec::new(),
        }
    }

    pub fn cancel(role: Role) -> Self {
        Self {
            role,
            behavior: Behavior::Cancel,
            writes: Vec::new(),
        }
    }

    /// Also write `contents` to `rel` under the workdir, as an editing agent would.
    pub fn writing(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }
}

/// Replays a queue of [`ScriptedRun`]s and records every request.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    queue: Mutex<VecDeque<ScriptedRun>>,
    calls: Mutex<Vec<(Role, String)>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            queue: Mutex::new(runs.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Roles invoked so far, in order.
    pub fn roles(&self) -> Vec<Role> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(role, _)| *role)
            .collect()
    }

    /// Prompts sent so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(&self, request: &AgentRequest, cancel: &CancelFlag) -> Result<AgentRun> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((request.role, request.prompt.clone()));
        let next = self
            .queue
            .lock()
            .expect("queue lock")
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected {} invocation", request.role))?;
        if next.role != request.role {
            bail!("expected {} invocation, got {}", next.role, request.role);
        }
        for (rel, contents) in &next.writes {
            fs::write(request.workdir.join(rel), contents)
                .with_context(|| format!("scripted write {rel}"))?;
        }
        match next.behavior {
            Behavior::Respond {
                text,
                exit_code,
                stderr,
            } => Ok(AgentRun {
                transcript: claude_transcript(&text),
                exit_code: Some(exit_code),
                success: exit_code == 0,
                timed_out: false,
                cancelled: false,
                stderr_tail: stderr,
            }),
            Behavior::SpawnError(message) => Err(anyhow!(message)),
            Behavior::Cancel => {
                cancel.cancel();
                Ok(AgentRun {
                    transcript: String::new(),
                    exit_code: None,
                    success: false,
                    timed_out: false,
                    cancelled: true,
                    stderr_tail: String::new(),
                })
            }
        }
    }
}

/// Minimal Claude stream-json transcript ending in a `result` event.
pub fn claude_transcript(text: &str) -> String {
    let init = json!({"type": "system", "subtype": "init", "session_id": "scripted"});
    let result = json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": text,
    });
    format!("{init}\n{result}\n")
}

/// Review summary JSON with `findings` P1 findings.
pub fn review_json(findings: u32) -> Value {
    let findings: Vec<Value> = (1..=findings)
        .map(|id| {
            json!({
                "id": id,
                "title": format!("finding {id}"),
                "priority": "P1",
                "evidence": format!("src/lib.rs:{id} is wrong"),
                "file": "src/lib.rs",
                "line": id,
            })
        })
        .collect();
    let correctness = if findings.is_empty() {
        "patch is correct"
    } else {
        "patch is incorrect"
    };
    json!({
        "findings": findings,
        "overall_correctness": correctness,
        "overall_explanation": "scripted review",
        "overall_confidence_score": 0.9,
    })
}

/// Fix summary JSON with `fixes` applied entries.
pub fn fix_json(decision: FixDecision, fixes: u32, stop_iteration: Option<bool>) -> Value {
    let fixes: Vec<Value> = (1..=fixes)
        .map(|id| {
            json!({
                "id": id,
                "title": format!("finding {id}"),
                "priority": "P1",
                "evidence": "patched",
            })
        })
        .collect();
    let mut value = json!({
        "decision": decision,
        "fixes": fixes,
        "skipped": [],
    });
    if let Some(stop) = stop_iteration {
        value["stop_iteration"] = json!(stop);
    }
    value
}

/// Counts checkpoints and rollbacks without touching any repository.
#[derive(Debug, Default)]
pub struct FakeCheckpointer {
    checkpoints: AtomicUsize,
    rollbacks: AtomicUsize,
    rollback_error: Option<String>,
}

impl FakeCheckpointer {
    pub fn failing_rollback(message: &str) -> Self {
        Self {
            rollback_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn checkpoints(&self) -> usize {
        self.checkpoints.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

impl Checkpointer for FakeCheckpointer {
    fn checkpoint(&self) -> Result<CheckpointHandle> {
        let n = self.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(CheckpointHandle {
            head: format!("{n:040x}"),
            snapshot: None,
            index: None,
            dirty_paths: Vec::new(),
        })
    }

    fn rollback(&self, _handle: &CheckpointHandle) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        match &self.rollback_error {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

/// Replays verification outcomes; passes once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    outcomes: Mutex<VecDeque<VerifyOutcome>>,
    runs: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new(outcomes: Vec<VerifyOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> Result<VerifyOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(VerifyOutcome::Passed))
    }
}
