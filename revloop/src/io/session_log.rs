//! Append-only JSONL session log under `<logs_root>/sessions/`.
//!
//! One `system` entry opens the log, one `iteration` entry follows each cycle
//! and a single `result` entry closes it. Every line is a complete JSON object.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};

use crate::core::decision::{FixSummary, ReviewSummary};
use crate::core::types::{AgentKind, CycleStatus, IterationError, RollbackOutcome};
use crate::io::lock::{normalize_branch, slug};

pub const SESSIONS_DIR: &str = "sessions";

/// Agent assignment recorded at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub session_name: String,
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub max_iterations: u32,
    pub reviewer: AgentEntry,
    pub fixer: AgentEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplifier: Option<AgentEntry>,
}

/// One review/fix cycle. Iteration 0 is the simplifier pre-pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEntry {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixes: Option<FixSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplifier: Option<FixSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IterationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

impl IterationEntry {
    pub fn new(iteration: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            iteration,
            duration_ms: 0,
            review: None,
            fixes: None,
            simplifier: None,
            error: None,
            rollback: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub status: CycleStatus,
    pub reason: String,
    pub iterations: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEntry {
    System(SystemEntry),
    Iteration(IterationEntry),
    Result(ResultEntry),
}

/// Handle to one session's log file.
#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    /// `<logs_root>/sessions/<project-slug>/<session_id>.jsonl`.
    pub fn path_for(logs_root: &Path, project_path: &str, session_id: &str) -> PathBuf {
        logs_root
            .join(SESSIONS_DIR)
            .join(slug(project_path))
            .join(format!("{session_id}.jsonl"))
    }

    /// Create a fresh log. Fails if the file already exists.
    pub fn create(logs_root: &Path, project_path: &str, session_id: &str) -> Result<Self> {
        let path = Self::path_for(logs_root, project_path, session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create session log dir {}", parent.display()))?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create session log {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize log entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open session log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append session log {}", self.path.display()))?;
        Ok(())
    }
}

/// Parse every entry of a session log.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// `<yyyymmdd_HHMMSS>-<8 lowercase alphanumerics>`, UTC.
pub fn new_session_id() -> String {
    session_id_at(Utc::now())
}

pub fn session_id_at(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let short: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(8)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{short}", now.format("%Y%m%d_%H%M%S"))
}

/// `<project-dir-name>@<branch>`, with `default` for no branch.
pub fn session_name(project: &Path, branch: Option<&str>) -> String {
    let dir = project
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| project.display().to_string());
    let branch = normalize_branch(branch).unwrap_or_else(|| "default".to_string());
    format!("{dir}@{branch}")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::core::types::Phase;

    #[test]
    fn session_ids_lead_with_timestamp() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("valid time");
        let id = session_id_at(at);
        let (stamp, short) = id.split_once('-').expect("separator");
        assert_eq!(stamp, "20260304_050607");
        assert_eq!(short.len(), 8);
        assert!(
            short
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_ne!(session_id_at(at), id);
    }

    #[test]
    fn session_name_uses_dir_and_branch() {
        let path = Path::new("/work/acme-api");
        assert_eq!(session_name(path, Some("feature/x")), "acme-api@feature/x");
        assert_eq!(session_name(path, None), "acme-api@default");
    }

    #[test]
    fn appends_entries_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = SessionLog::create(temp.path(), "/work/acme", "20260101_000000-abcdefgh")
            .expect("create");
        assert!(
            log.path()
                .ends_with("sessions/work-acme/20260101_000000-abcdefgh.jsonl")
        );

        let system = LogEntry::System(SystemEntry {
            timestamp: Utc::now(),
            session_id: "20260101_000000-abcdefgh".to_string(),
            session_name: "acme@main".to_string(),
            project_path: "/work/acme".to_string(),
            branch: Some("main".to_string()),
            max_iterations: 3,
            reviewer: AgentEntry {
                agent: AgentKind::Claude,
                model: None,
            },
            fixer: AgentEntry {
                agent: AgentKind::Codex,
                model: Some("gpt-5".to_string()),
            },
            simplifier: None,
        });
        let mut iteration = IterationEntry::new(1);
        iteration.duration_ms = 42;
        iteration.error = Some(IterationError {
            phase: Phase::Fix,
            message: "fixer exited with status 1".to_string(),
            exit_code: Some(1),
            attempts: 3,
        });
        iteration.rollback = Some(RollbackOutcome {
            attempted: true,
            success: true,
            reason: None,
        });
        let iteration = LogEntry::Iteration(iteration);
        let result = LogEntry::Result(ResultEntry {
            timestamp: Utc::now(),
            success: false,
            status: CycleStatus::Failed,
            reason: "fix phase failed".to_string(),
            iterations: 1,
            duration_ms: 50,
        });

        for entry in [&system, &iteration, &result] {
            log.append(entry).expect("append");
        }

        let raw = fs::read_to_string(log.path()).expect("read");
        let types: Vec<&str> = raw
            .lines()
            .map(|line| {
                if line.starts_with(r#"{"type":"system""#) {
                    "system"
                } else if line.starts_with(r#"{"type":"iteration""#) {
                    "iteration"
                } else {
                    "result"
                }
            })
            .collect();
        assert_eq!(types, ["system", "iteration", "result"]);
        assert!(!raw.contains("\"review\""));

        let entries = read_entries(log.path()).expect("read entries");
        assert_eq!(entries, vec![system, iteration, result]);
    }

    #[test]
    fn create_refuses_existing_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        SessionLog::create(temp.path(), "/p", "id").expect("first");
        assert!(SessionLog::create(temp.path(), "/p", "id").is_err());
    }
}
