//! Engine configuration stored under `<project>/.revloop/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::AgentKind;

pub const CONFIG_DIR: &str = ".revloop";
pub const CONFIG_FILE: &str = "config.toml";

/// Engine configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or a partial
/// file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on review/fix iterations per run.
    pub max_iterations: u32,

    /// Wall-clock budget for one iteration (all agent calls, retries and verification).
    pub iteration_timeout_secs: u64,

    /// Stdout bytes kept in memory per agent invocation.
    pub output_limit_bytes: usize,

    /// Retries after the first failed invocation of a phase.
    pub max_retries: u32,

    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Grace period between SIGTERM and a hard kill on cancellation or timeout.
    pub kill_grace_secs: u64,

    /// Where session logs and lock files live. Defaults to `$HOME/.revloop`,
    /// outside the project so rollback never touches them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_root: Option<PathBuf>,

    pub lock: LockConfig,
    pub reviewer: AgentConfig,
    pub fixer: AgentConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplifier: Option<AgentConfig>,
    pub verify: VerifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub heartbeat_interval_secs: u64,
    /// A lock whose heartbeat is older than this is reclaimable.
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            stale_after_secs: 60,
        }
    }
}

impl LockConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Which agent CLI plays a role, and how to call it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentKind,
    /// Binary to run instead of the agent's usual name on `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Appended verbatim to the agent's argv.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentKind::Claude,
            command: None,
            model: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Command run after each fix (e.g. `["cargo","test"]`). Empty disables
    /// verification.
    pub command: Vec<String>,
    /// Truncate verification stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            iteration_timeout_secs: 30 * 60,
            output_limit_bytes: 2_000_000,
            max_retries: 2,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            kill_grace_secs: 5,
            logs_root: None,
            lock: LockConfig::default(),
            reviewer: AgentConfig::default(),
            fixer: AgentConfig::default(),
            simplifier: None,
            verify: VerifyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow!("max_delay_ms must be >= base_delay_ms"));
        }
        if self.lock.heartbeat_interval_secs == 0 {
            return Err(anyhow!("lock.heartbeat_interval_secs must be > 0"));
        }
        if self.lock.stale_after_secs <= self.lock.heartbeat_interval_secs {
            return Err(anyhow!(
                "lock.stale_after_secs must be greater than lock.heartbeat_interval_secs"
            ));
        }
        if self
            .verify
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("verify.command must start with a program name"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// `logs_root`, or `$HOME/.revloop` when unset.
    pub fn resolved_logs_root(&self) -> PathBuf {
        if let Some(root) = &self.logs_root {
            return root.clone();
        }
        default_logs_root()
    }
}

pub fn default_logs_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(CONFIG_DIR),
        _ => std::env::temp_dir().join("revloop"),
    }
}

/// `<project>/.revloop/config.toml`.
pub fn config_path(project: &Path) -> PathBuf {
    project.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
