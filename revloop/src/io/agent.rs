//! Agent invocation behind the [`AgentRunner`] trait.
//!
//! [`CliAgentRunner`] spawns the agent CLI for a role, streams its stdout
//! through a [`StreamRenderer`] for live display, and returns the raw
//! transcript. Tests use scripted runners that return canned transcripts
//! without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::stream::StreamRenderer;
use crate::core::types::{AgentKind, Role};
use crate::io::config::AgentConfig;
use crate::io::process::{CancelFlag, CommandOutput, StreamLimits, run_command_streaming};

/// Environment variable telling the agent which role it plays.
pub const ROLE_ENV: &str = "REVLOOP_ROLE";
const STDERR_TAIL_LINES: usize = 20;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub role: Role,
    pub agent: AgentConfig,
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub kill_grace: Duration,
    /// Raw stdout is copied here when set.
    pub transcript_path: Option<PathBuf>,
}

/// What a finished (or stopped) invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub transcript: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stderr_tail: String,
}

impl AgentRun {
    /// One-line description of why the run did not succeed.
    pub fn failure_message(&self, kind: AgentKind) -> Option<String> {
        if self.cancelled {
            return Some(format!("{kind} was cancelled"));
        }
        if self.timed_out {
            return Some(format!("{kind} timed out"));
        }
        if self.success {
            return None;
        }
        let mut msg = match self.exit_code {
            Some(code) => format!("{kind} exited with status {code}"),
            None => format!("{kind} was killed by a signal"),
        };
        if !self.stderr_tail.is_empty() {
            msg.push_str(": ");
            msg.push_str(&self.stderr_tail);
        }
        Some(msg)
    }
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    /// Spawn errors are `Err`; everything the child did is in [`AgentRun`].
    fn run(&self, request: &AgentRequest, cancel: &CancelFlag) -> Result<AgentRun>;
}

/// How to launch one agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Prompt fed on stdin, for CLIs that read it there.
    pub stdin: Option<String>,
}

/// Build the argv for `request`. Roles that edit code get write access.
pub fn command_spec(request: &AgentRequest) -> CommandSpec {
    let edits = request.role != Role::Reviewer;
    let model = request.agent.model.as_deref();
    let prompt = request.prompt.clone();
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let (program, prompt_on_stdin) = match request.agent.agent {
        AgentKind::Claude => {
            push(&[
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
            ]);
            if edits {
                push(&["--dangerously-skip-permissions"]);
            }
            if let Some(model) = model {
                push(&["--model", model]);
            }
            ("claude", true)
        }
        AgentKind::Codex => {
            push(&["exec", "--json", "--skip-git-repo-check", "--sandbox"]);
            push(&[if edits { "workspace-write" } else { "read-only" }]);
            if let Some(model) = model {
                push(&["-m", model]);
            }
            ("codex", true)
        }
        AgentKind::Droid => {
            push(&["exec", "--output-format", "stream-json"]);
            if edits {
                push(&["--auto", "medium"]);
            }
            if let Some(model) = model {
                push(&["-m", model]);
            }
            ("droid", false)
        }
        AgentKind::Gemini => {
            push(&["-o", "stream-json"]);
            if edits {
                push(&["--yolo"]);
            }
            if let Some(model) = model {
                push(&["-m", model]);
            }
            ("gemini", true)
        }
        AgentKind::Opencode => {
            push(&["run", "--format", "json"]);
            if let Some(model) = model {
                push(&["-m", model]);
            }
            ("opencode", false)
        }
        AgentKind::Pi => {
            push(&["--mode", "json", "-p"]);
            if let Some(model) = model {
                push(&["--model", model]);
            }
            ("pi", false)
        }
    };

    args.extend(request.agent.extra_args.iter().cloned());
    let stdin = if prompt_on_stdin {
        // Codex reads the prompt from stdin when it is given as `-`.
        if request.agent.agent == AgentKind::Codex {
            args.push("-".to_string());
        }
        Some(prompt)
    } else {
        args.push(prompt);
        None
    };

    CommandSpec {
        program: request
            .agent
            .command
            .clone()
            .unwrap_or_else(|| program.to_string()),
        args,
        stdin,
    }
}

/// Spawns the configured agent CLI.
#[derive(Debug, Clone, Default)]
pub struct CliAgentRunner {
    /// Print rendered agent output to stderr as it arrives.
    pub echo: bool,
}

impl CliAgentRunner {
    pub fn new(echo: bool) -> Self {
        Self { echo }
    }

    fn show(&self, role: Role, chunk: &str) {
        debug!(%role, chunk, "agent output");
        if self.echo {
            for line in chunk.lines() {
                eprintln!("[{role}] {line}");
            }
        }
    }
}

impl AgentRunner for CliAgentRunner {
    #[instrument(skip_all, fields(role = %request.role, agent = %request.agent.agent, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest, cancel: &CancelFlag) -> Result<AgentRun> {
        let spec = command_spec(request);
        info!(workdir = %request.workdir.display(), program = %spec.program, "starting agent");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&request.workdir)
            .env(ROLE_ENV, request.role.as_str());

        let mut renderer = StreamRenderer::new(request.agent.agent);
        let limits = StreamLimits {
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
            kill_grace: request.kill_grace,
        };
        let output = run_command_streaming(
            cmd,
            spec.stdin.as_deref().map(str::as_bytes),
            limits,
            cancel,
            |line| {
                for chunk in renderer.push_line(line) {
                    self.show(request.role, &chunk);
                }
            },
        )
        .with_context(|| format!("run {}", spec.program))?;
        for chunk in renderer.finish() {
            self.show(request.role, &chunk);
        }

        if let Some(path) = &request.transcript_path {
            write_transcript(path, &output)?;
        }
        let run = agent_run(output);
        match run.failure_message(request.agent.agent) {
            Some(msg) => warn!(%msg, "agent run failed"),
            None => debug!("agent completed successfully"),
        }
        Ok(run)
    }
}

fn agent_run(output: CommandOutput) -> AgentRun {
    // A cancelled child's partial output is never trusted.
    let transcript = if output.cancelled {
        String::new()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    AgentRun {
        transcript,
        exit_code: output.status.code(),
        success: output.status.success() && !output.timed_out && !output.cancelled,
        timed_out: output.timed_out,
        cancelled: output.cancelled,
        stderr_tail: output.stderr_tail(STDERR_TAIL_LINES),
    }
}

fn write_transcript(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    // Streamed output keeps its tail, so the notice goes first.
    let mut buf = Vec::with_capacity(output.stdout.len() + 64);
    if output.stdout_truncated > 0 {
        buf.extend_from_slice(
            format!("[agent stdout: first {} bytes dropped]\n", output.stdout_truncated).as_bytes(),
        );
    }
    buf.extend_from_slice(&output.stdout);
    fs::write(path, buf).with_context(|| format!("write transcript {}", path.display()))
}
