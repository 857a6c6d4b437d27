//! revloop: automated review/fix loops driven by coding-agent CLIs.
//!
//! `revloop run` reviews the current branch with one agent, hands the
//! findings to another, and repeats until the review comes back clean.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use revloop::core::extract::{extract, extract_from_transcript};
use revloop::core::stream::render_transcript;
use revloop::core::types::{AgentKind, CycleStatus, Role};
use revloop::cycle::CycleEngine;
use revloop::exit_codes;
use revloop::io::agent::CliAgentRunner;
use revloop::io::config::{EngineConfig, config_path, load_config, write_config};
use revloop::io::git::Git;
use revloop::io::lock::{SessionLock, SessionRef, lock_matches_session};
use revloop::io::process::CancelFlag;
use revloop::io::verify::CommandVerifier;
use revloop::logging;

#[derive(Parser)]
#[command(
    name = "revloop",
    version,
    about = "Run coding agents in a review/fix loop until the review is clean"
)]
struct Cli {
    /// Log progress at info level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run review/fix iterations on a project.
    Run {
        /// Project directory (defaults to the current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Branch to key the session lock on (defaults to the checked-out branch).
        #[arg(long)]
        branch: Option<String>,
        /// Config file (defaults to `<project>/.revloop/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Do not echo agent output to stderr.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Write a default `.revloop/config.toml`.
    Init {
        #[arg(long)]
        project: Option<PathBuf>,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// List live session locks.
    Locks {
        /// Overrides the config's `logs_root`.
        #[arg(long)]
        logs_root: Option<PathBuf>,
        /// Config whose lock settings decide liveness (defaults to
        /// `./.revloop/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Only show the lock held by this session id.
        #[arg(long)]
        session: Option<String>,
    },
    /// Format a saved agent transcript for display.
    Render {
        #[arg(long)]
        agent: AgentKind,
        /// Transcript file, or `-` for stdin.
        file: PathBuf,
    },
    /// Extract the structured decision from a transcript and print it as JSON.
    Extract {
        #[arg(long)]
        role: Role,
        /// Treat the input as this agent's stream; plain text when omitted.
        #[arg(long)]
        agent: Option<AgentKind>,
        /// Transcript file, or `-` for stdin.
        file: PathBuf,
    },
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match cli.command {
        Command::Run {
            project,
            branch,
            config,
            max_iterations,
            quiet,
        } => cmd_run(project, branch, config, max_iterations, quiet),
        Command::Init { project, force } => cmd_init(project, force),
        Command::Locks {
            logs_root,
            config,
            session,
        } => cmd_locks(logs_root, config, session),
        Command::Render { agent, file } => cmd_render(agent, &file),
        Command::Extract { role, agent, file } => cmd_extract(role, agent, &file),
    }
}

fn cmd_run(
    project: Option<PathBuf>,
    branch: Option<String>,
    config: Option<PathBuf>,
    max_iterations: Option<u32>,
    quiet: bool,
) -> Result<i32> {
    let project = resolve_project(project)?;
    let git = Git::new(&project);
    if !git.is_repo() {
        bail!("{} is not a git repository", project.display());
    }
    let config_file = config.unwrap_or_else(|| config_path(&project));
    let mut cfg = load_config(&config_file)?;
    if let Some(max) = max_iterations {
        cfg.max_iterations = max;
        cfg.validate()?;
    }
    let branch = match branch {
        Some(branch) => Some(branch),
        None => git.current_branch()?,
    };

    let cancel = CancelFlag::new();
    watch_ctrl_c(cancel.clone())?;

    let agents = CliAgentRunner::new(!quiet);
    let verifier = CommandVerifier;
    let engine = CycleEngine::new(&cfg, &agents, &git, &verifier, cancel);
    let result = engine.run_cycle(&project, branch.as_deref());

    if let Some(conflict) = &result.busy {
        eprintln!("{conflict}");
        return Ok(exit_codes::BUSY);
    }
    println!(
        "{} after {} iteration(s): {}",
        result.final_status, result.iterations, result.reason
    );
    if let Some(path) = &result.session_path {
        println!("session log: {}", path.display());
    }
    Ok(match (result.success, result.final_status) {
        (true, _) => exit_codes::OK,
        (false, CycleStatus::Interrupted) => exit_codes::INTERRUPTED,
        (false, _) => exit_codes::FAILED,
    })
}

fn cmd_init(project: Option<PathBuf>, force: bool) -> Result<i32> {
    let project = resolve_project(project)?;
    let path = config_path(&project);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &EngineConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_locks(
    logs_root: Option<PathBuf>,
    config: Option<PathBuf>,
    session: Option<String>,
) -> Result<i32> {
    let config_file = match config {
        Some(path) => path,
        None => config_path(&resolve_project(None)?),
    };
    let cfg = load_config(&config_file)?;
    let logs_root = logs_root.unwrap_or_else(|| cfg.resolved_logs_root());
    let mut locks = SessionLock::new(&logs_root, cfg.lock).list_active()?;
    if let Some(session_id) = session {
        let wanted = SessionRef {
            session_id: Some(session_id),
            ..SessionRef::default()
        };
        locks.retain(|lock| lock_matches_session(lock, &wanted));
    }
    let now = Utc::now();
    for lock in &locks {
        println!(
            "{}\t{}\tpid {}\t{}\theartbeat {}s ago",
            lock.session_id,
            lock.session_name,
            lock.pid,
            lock.state,
            lock.heartbeat_age(now).as_secs()
        );
    }
    if locks.is_empty() {
        eprintln!("no active sessions under {}", logs_root.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_render(agent: AgentKind, file: &Path) -> Result<i32> {
    let transcript = read_input(file)?;
    for chunk in render_transcript(agent, &transcript) {
        println!("{chunk}");
    }
    Ok(exit_codes::OK)
}

fn cmd_extract(role: Role, agent: Option<AgentKind>, file: &Path) -> Result<i32> {
    let text = read_input(file)?;
    let result = match agent {
        Some(agent) => extract_from_transcript(agent, &text, role),
        None => extract(&text, role),
    };
    match result {
        Ok(extraction) => {
            let json = serde_json::to_string_pretty(&extraction).context("serialize extraction")?;
            println!("{json}");
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            eprintln!("{failure}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn resolve_project(project: Option<PathBuf>) -> Result<PathBuf> {
    let project = match project {
        Some(project) => project,
        None => std::env::current_dir().context("resolve current directory")?,
    };
    fs::canonicalize(&project).with_context(|| format!("resolve project {}", project.display()))
}

fn read_input(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read stdin")?;
        return Ok(buf);
    }
    fs::read_to_string(file).with_context(|| format!("read {}", file.display()))
}

/// Trip `cancel` on the first Ctrl-C. The engine checks it between phases and
/// while an agent is running.
fn watch_ctrl_c(cancel: CancelFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("revloop-signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, rolling back and stopping");
                    cancel.cancel();
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["revloop", "run"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                project: None,
                branch: None,
                max_iterations: None,
                quiet: false,
                ..
            }
        ));
    }

    #[test]
    fn parse_extract_role_and_agent() {
        let cli = Cli::parse_from([
            "revloop",
            "extract",
            "--role",
            "fixer",
            "--agent",
            "codex",
            "out.jsonl",
        ]);
        match cli.command {
            Command::Extract { role, agent, file } => {
                assert_eq!(role, Role::Fixer);
                assert_eq!(agent, Some(AgentKind::Codex));
                assert_eq!(file, PathBuf::from("out.jsonl"));
            }
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn parse_locks_with_config() {
        let cli = Cli::parse_from(["revloop", "locks", "--config", "ci.toml"]);
        assert!(matches!(
            cli.command,
            Command::Locks {
                logs_root: None,
                config: Some(_),
                session: None,
            }
        ));
    }

    #[test]
    fn unknown_agent_is_rejected() {
        assert!(Cli::try_parse_from(["revloop", "render", "--agent", "cursor", "x"]).is_err());
    }
}
