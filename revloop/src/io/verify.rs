//! Verification gate run after an agent edits the working tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const FAILURE_TAIL_LINES: usize = 40;

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Passed,
    Failed {
        exit_code: Option<i32>,
        timed_out: bool,
        /// Last lines of combined output, for the next fixer prompt.
        tail: String,
    },
}

pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Runs the configured command and logs its output.
pub struct CommandVerifier;

impl Verifier for CommandVerifier {
    #[instrument(skip_all, fields(command = %request.command.join(" ")))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty verify command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let output = run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run verify command {program}"))?;
        write_verify_log(&request.log_path, &output, request.output_limit_bytes)?;

        if output.status.success() && !output.timed_out {
            info!("verification passed");
            return Ok(VerifyOutcome::Passed);
        }
        warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "verification failed");
        Ok(VerifyOutcome::Failed {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            tail: combined_tail(&output, FAILURE_TAIL_LINES),
        })
    }
}

/// Skip verification when no command is configured.
pub fn run_verify_if_configured<V: Verifier + ?Sized>(
    verifier: &V,
    request: &VerifyRequest,
) -> Result<Option<VerifyOutcome>> {
    if request.command.is_empty() {
        return Ok(None);
    }
    verifier.verify(request).map(Some)
}

fn combined_tail(output: &CommandOutput, lines: usize) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout: Vec<&str> = stdout.lines().collect();
    let mut tail = stdout[stdout.len().saturating_sub(lines)..].join("\n");
    let stderr = output.stderr_tail(lines);
    if !stderr.is_empty() {
        if !tail.is_empty() {
            tail.push('\n');
        }
        tail.push_str(&stderr);
    }
    if output.timed_out {
        tail.push_str("\n[verification timed out]");
    }
    tail
}

fn write_verify_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("verify"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("verify"));
    if output.timed_out {
        buf.push_str("\n[verify timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }
    fs::write(path, buf).with_context(|| format!("write verify log {}", path.display()))
}
