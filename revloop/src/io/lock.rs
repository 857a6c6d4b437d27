//! Cross-process session lock keyed by project path and branch.
//!
//! One JSON lock file per `(project, branch)` lives under
//! `<logs_root>/locks/`. Creation is exclusive (temp file + no-clobber link),
//! so two racing acquirers cannot both win. A lock is live while its
//! heartbeat is fresh and its pid still runs; anything else may be reclaimed.
//!
//! Reclaiming renames the file aside under a name unique to the acquirer,
//! checks it is byte-for-byte the record that was judged dead, and only then
//! deletes it. If a fresh lock slipped in between the check and the rename it
//! is linked back into place.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::core::types::CycleStatus;
use crate::io::config::LockConfig;

pub const LOCKS_DIR: &str = "locks";
const LOCK_SUFFIX: &str = ".lock.json";
const MAX_ACQUIRE_ATTEMPTS: u32 = 5;
/// Stored branch meaning "no branch".
const DEFAULT_BRANCH: &str = "default";

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub session_id: String,
    pub session_name: String,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub pid: u32,
    pub project_path: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub state: CycleStatus,
    pub mode: String,
    pub lock_path: PathBuf,
}

impl LockRecord {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Fresh heartbeat and running owner.
    pub fn is_live(&self, settings: &LockConfig, now: DateTime<Utc>) -> bool {
        self.heartbeat_age(now) < settings.stale_after() && is_process_alive(self.pid)
    }
}

/// Identity of the run asking for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub session_name: String,
    /// Free-form run mode recorded in the lock (e.g. `cycle`).
    pub mode: String,
}

/// Reference used to match a lock against a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: Option<String>,
    pub project_path: String,
    pub branch: Option<String>,
}

/// The lock is held by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub holder: LockRecord,
    pub heartbeat_age: Duration,
}

impl fmt::Display for LockConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is busy: session {} ({}) pid {} is {}, last heartbeat {}s ago",
            describe_key(&self.holder.project_path, self.holder.branch.as_deref()),
            self.holder.session_id,
            self.holder.session_name,
            self.holder.pid,
            self.holder.state,
            self.heartbeat_age.as_secs()
        )
    }
}

impl std::error::Error for LockConflict {}

#[derive(Debug)]
pub enum Acquire {
    Acquired(LockHandle),
    Conflict(LockConflict),
}

/// Lock directory plus liveness settings.
#[derive(Debug, Clone)]
pub struct SessionLock {
    dir: PathBuf,
    settings: LockConfig,
}

impl SessionLock {
    pub fn new(logs_root: &Path, settings: LockConfig) -> Self {
        Self {
            dir: logs_root.join(LOCKS_DIR),
            settings,
        }
    }

    /// Path of the lock file guarding `(project, branch)`.
    pub fn lock_path(&self, project_path: &str, branch: Option<&str>) -> PathBuf {
        let branch_slug = normalize_branch(branch)
            .as_deref()
            .map_or_else(|| DEFAULT_BRANCH.to_string(), slug);
        self.dir
            .join(format!("{}--{branch_slug}{LOCK_SUFFIX}", slug(project_path)))
    }

    /// Take the lock for `(project, branch)`, reclaiming it if the holder is
    /// stale or dead. A live holder yields [`Acquire::Conflict`].
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    pub fn acquire(
        &self,
        project: &Path,
        branch: Option<&str>,
        session: &SessionInfo,
    ) -> Result<Acquire> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir {}", self.dir.display()))?;
        let project_path = normalize_project_path(project);
        let branch = normalize_branch(branch);
        let path = self.lock_path(&project_path, branch.as_deref());

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let now = Utc::now();
            let record = LockRecord {
                session_id: session.session_id.clone(),
                session_name: session.session_name.clone(),
                start_time: now,
                last_heartbeat: now,
                pid: std::process::id(),
                project_path: project_path.clone(),
                branch: branch.clone(),
                state: CycleStatus::Idle,
                mode: session.mode.clone(),
                lock_path: path.clone(),
            };
            if create_exclusive(&self.dir, &path, &record)? {
                info!(path = %path.display(), attempt, "session lock acquired");
                return Ok(Acquire::Acquired(LockHandle::new(path, record)));
            }

            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
            };
            match serde_json::from_slice::<LockRecord>(&raw) {
                Ok(holder) if holder.is_live(&self.settings, Utc::now()) => {
                    let heartbeat_age = holder.heartbeat_age(Utc::now());
                    debug!(holder = %holder.session_id, "lock held by live session");
                    return Ok(Acquire::Conflict(LockConflict {
                        holder,
                        heartbeat_age,
                    }));
                }
                Ok(holder) => {
                    let alive = is_process_alive(holder.pid);
                    info!(
                        holder = %holder.session_id,
                        pid = holder.pid,
                        alive,
                        heartbeat_age_secs = holder.heartbeat_age(Utc::now()).as_secs(),
                        "reclaiming stale session lock"
                    );
                }
                Err(e) => {
                    info!(err = %e, path = %path.display(), "reclaiming unreadable session lock");
                }
            }
            reclaim(&path, &raw, &session.session_id)?;
        }

        Err(anyhow!(
            "could not acquire {} after {MAX_ACQUIRE_ATTEMPTS} attempts",
            path.display()
        ))
    }

    /// All live locks, oldest first. Unreadable files are skipped.
    pub fn list_active(&self) -> Result<Vec<LockRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read lock dir {}", self.dir.display()));
            }
        };
        let now = Utc::now();
        let mut live = Vec::new();
        for entry in entries {
            let path = entry.context("read lock dir entry")?.path();
            let is_lock = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(LOCK_SUFFIX));
            if !is_lock {
                continue;
            }
            match read_record(&path) {
                Ok(Some(record)) if record.is_live(&self.settings, now) => live.push(record),
                Ok(_) => {}
                Err(e) => debug!(err = %e, path = %path.display(), "skipping unreadable lock"),
            }
        }
        live.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(live)
    }
}

/// A held lock. Released on [`LockHandle::release`] or drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    inner: Mutex<HandleState>,
}

#[derive(Debug)]
struct HandleState {
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    fn new(path: PathBuf, record: LockRecord) -> Self {
        Self {
            path,
            inner: Mutex::new(HandleState {
                record,
                released: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> Result<LockRecord> {
        Ok(self.state()?.record.clone())
    }

    /// Refresh `lastHeartbeat`. Returns `false` once the file no longer
    /// carries our session id (released, reclaimed, or replaced).
    pub fn heartbeat(&self) -> Result<bool> {
        self.update(|record| record.last_heartbeat = Utc::now())
    }

    /// Record the engine's current state in the lock file.
    pub fn set_state(&self, state: CycleStatus) -> Result<bool> {
        self.update(|record| {
            record.state = state;
            record.last_heartbeat = Utc::now();
        })
    }

    /// Delete the lock file if it is still ours. Idempotent.
    pub fn release(&self) -> Result<bool> {
        let mut state = self.state()?;
        if state.released {
            return Ok(false);
        }
        state.released = true;
        if !self.still_owned(&state.record.session_id)? {
            warn!(path = %self.path.display(), "lock no longer ours at release");
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("remove lock {}", self.path.display()));
            }
        }
        info!(path = %self.path.display(), "session lock released");
        Ok(true)
    }

    fn update(&self, mutate: impl FnOnce(&mut LockRecord)) -> Result<bool> {
        let mut state = self.state()?;
        if state.released || !self.still_owned(&state.record.session_id)? {
            return Ok(false);
        }
        mutate(&mut state.record);
        let dir = self
            .path
            .parent()
            .with_context(|| format!("lock path missing parent {}", self.path.display()))?;
        let temp = write_temp(dir, &state.record)?;
        temp.persist(&self.path)
            .with_context(|| format!("replace lock {}", self.path.display()))?;
        Ok(true)
    }

    fn still_owned(&self, session_id: &str) -> Result<bool> {
        Ok(read_record(&self.path)?.is_some_and(|current| current.session_id == session_id))
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, HandleState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("lock handle state poisoned"))
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(err = %e, path = %self.path.display(), "failed to release lock on drop");
        }
    }
}

/// True when the lock record belongs to the referenced session: same session
/// id when both have one, otherwise same normalized project path and branch.
pub fn lock_matches_session(lock: &LockRecord, session: &SessionRef) -> bool {
    if let Some(id) = &session.session_id {
        return *id == lock.session_id;
    }
    normalize_path_str(&lock.project_path) == normalize_path_str(&session.project_path)
        && normalize_branch(lock.branch.as_deref()) == normalize_branch(session.branch.as_deref())
}

/// Canonical absolute form of a project directory, falling back to the path
/// as given when it cannot be resolved.
pub fn normalize_project_path(project: &Path) -> String {
    let resolved = fs::canonicalize(project).unwrap_or_else(|_| project.to_path_buf());
    normalize_path_str(&resolved.to_string_lossy())
}

fn normalize_path_str(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        path.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `None`, empty, and `"default"` all mean "no branch".
pub fn normalize_branch(branch: Option<&str>) -> Option<String> {
    branch
        .map(str::trim)
        .filter(|b| !b.is_empty() && *b != DEFAULT_BRANCH)
        .map(str::to_string)
}

/// Filesystem-safe rendering of a path or branch name.
pub fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_') {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

fn describe_key(project_path: &str, branch: Option<&str>) -> String {
    match branch {
        Some(branch) => format!("{project_path} ({branch})"),
        None => project_path.to_string(),
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Without a portable probe every pid counts as running; heartbeat age decides.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read lock {}", path.display())),
    };
    let record = serde_json::from_slice(&raw)
        .with_context(|| format!("parse lock {}", path.display()))?;
    Ok(Some(record))
}

fn write_temp(dir: &Path, record: &LockRecord) -> Result<NamedTempFile> {
    let mut buf = serde_json::to_vec_pretty(record).context("serialize lock record")?;
    buf.push(b'\n');
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp lock in {}", dir.display()))?;
    temp.write_all(&buf).context("write temp lock")?;
    temp.as_file().sync_all().context("sync temp lock")?;
    Ok(temp)
}

/// Publish `record` at `path` unless a file is already there.
fn create_exclusive(dir: &Path, path: &Path, record: &LockRecord) -> Result<bool> {
    let temp = write_temp(dir, record)?;
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error).with_context(|| format!("create lock {}", path.display())),
    }
}

/// Remove the lock at `path` if it still holds exactly `judged`.
fn reclaim(path: &Path, judged: &[u8], acquirer: &str) -> Result<()> {
    let aside = path.with_extension(format!("reclaim-{}-{}", std::process::id(), slug(acquirer)));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("move stale lock {}", path.display()));
        }
    }

    let moved = fs::read(&aside).with_context(|| format!("read {}", aside.display()))?;
    if moved != judged {
        // A live lock replaced the stale one after we judged it; put it back.
        warn!(path = %path.display(), "lock changed during reclaim, restoring");
        match fs::hard_link(&aside, path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "lock re-created during reclaim, dropping moved copy");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("restore lock {}", path.display()));
            }
        }
    }
    fs::remove_file(&aside).with_context(|| format!("remove {}", aside.display()))?;
    Ok(())
}
