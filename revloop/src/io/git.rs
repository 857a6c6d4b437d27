//! Git adapter: branch lookup plus working-tree checkpoints.
//!
//! A checkpoint records two trees without touching the index or the working
//! tree: the staged state (`write-tree`) and the whole working tree, untracked
//! files included, built in a scratch index. Rollback resets to the recorded
//! HEAD, removes anything new, checks the working-tree snapshot out and puts
//! the staged state back.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Working-tree state captured before an agent is allowed to edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHandle {
    /// Commit checked out when the checkpoint was taken.
    pub head: String,
    /// Tree of the working tree, untracked files included; `None` when clean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    /// Tree of the index as the user left it; `None` when clean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Paths that were dirty at checkpoint time.
    pub dirty_paths: Vec<String>,
}

/// Checkpoint/rollback seam used by the cycle engine.
pub trait Checkpointer {
    fn checkpoint(&self) -> Result<CheckpointHandle>;
    /// Restore the working tree to exactly the checkpointed state.
    fn rollback(&self, handle: &CheckpointHandle) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    /// Current branch name, `None` on a detached HEAD.
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Ok(None);
        }
        debug!(branch = %name, "current branch");
        Ok(Some(name))
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self
            .run_capture(&["rev-parse", "HEAD"])
            .context("resolve HEAD (repository needs at least one commit)")?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Tree of the whole working tree (respects .gitignore), staged through a
    /// scratch index so the real one is left alone.
    fn worktree_tree(&self) -> Result<String> {
        let scratch = tempfile::tempdir().context("create scratch index dir")?;
        let index = scratch.path().join("index");
        self.run_checked_in(&["read-tree", "HEAD"], Some(&index))?;
        self.run_checked_in(&["add", "-A"], Some(&index))?;
        let out = self.run_checked_in(&["write-tree"], Some(&index))?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_in(args, None)
    }

    fn run_checked_in(&self, args: &[&str], index: Option<&Path>) -> Result<Output> {
        let output = self.run_in(args, index)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_in(args, None)
    }

    fn run_in(&self, args: &[&str], index: Option<&Path>) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        if let Some(index) = index {
            cmd.env("GIT_INDEX_FILE", index);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Checkpointer for Git {
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn checkpoint(&self) -> Result<CheckpointHandle> {
        let head = self.head_sha()?;
        let dirty_paths: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();

        let (snapshot, index) = if dirty_paths.is_empty() {
            (None, None)
        } else {
            let index = self
                .run_capture(&["write-tree"])
                .context("record staged changes")?;
            let snapshot = self
                .worktree_tree()
                .context("snapshot working tree")?;
            (Some(snapshot), Some(index.trim().to_string()))
        };
        debug!(head = %head, snapshot = ?snapshot, dirty = dirty_paths.len(), "checkpoint created");
        Ok(CheckpointHandle {
            head,
            snapshot,
            index,
            dirty_paths,
        })
    }

    #[instrument(skip_all, fields(head = %handle.head))]
    fn rollback(&self, handle: &CheckpointHandle) -> Result<()> {
        self.run_checked(&["reset", "--hard", "-q", &handle.head])
            .context("reset to checkpoint HEAD")?;
        self.run_checked(&["clean", "-fdq"])
            .context("remove files created after checkpoint")?;
        if let Some(snapshot) = &handle.snapshot {
            self.run_checked(&["read-tree", "--reset", "-u", snapshot])
                .context("restore checkpoint snapshot")?;
        }
        if let Some(index) = &handle.index {
            self.run_checked(&["read-tree", index])
                .context("restore staged changes")?;
        }
        info!(restored_paths = handle.dirty_paths.len(), "rolled back to checkpoint");
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
