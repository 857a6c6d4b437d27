//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared cancellation request, set from a signal handler and polled by the
/// engine and the subprocess loop.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Limits applied to a streamed child.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory; the rest is drained and counted.
    /// Streamed stdout keeps its newest whole lines, since the decision block
    /// comes last.
    pub output_limit_bytes: usize,
    /// Time between SIGTERM and a hard kill.
    pub kill_grace: Duration,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled: false,
    })
}

/// Run a command, handing each stdout line to `on_line` as it arrives.
///
/// Stdout is read on its own thread and delivered over a channel; this thread
/// polls the channel, the child, the deadline and `cancel`. On timeout or
/// cancellation the child gets SIGTERM, then a hard kill after
/// `limits.kill_grace`.
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: StreamLimits,
    cancel: &CancelFlag,
    mut on_line: impl FnMut(&str),
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout_handle = thread::spawn(move || forward_lines(stdout, tx));
    let limit = limits.output_limit_bytes;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let deadline = Instant::now() + limits.timeout;
    let mut collected = LineTail::new(limit);
    let mut stdout_closed = false;
    let mut timed_out = false;
    let mut cancelled = false;

    let mut take_line = |line: Vec<u8>, collected: &mut LineTail| {
        let text = String::from_utf8_lossy(&line);
        on_line(text.trim_end_matches(['\n', '\r']));
        collected.push(line);
    };

    let status = loop {
        if stdout_closed {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
                break status;
            }
        } else {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => take_line(line, &mut collected),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => stdout_closed = true,
            }
            if let Some(status) = child.try_wait().context("poll command")? {
                break status;
            }
        }

        if cancel.is_cancelled() {
            info!("cancellation requested, terminating child");
            cancelled = true;
            break terminate(&mut child, limits.kill_grace)?;
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, terminating"
            );
            timed_out = true;
            break terminate(&mut child, limits.kill_grace)?;
        }
    };

    // Lines written just before exit may still be in flight. A grandchild that
    // inherited stdout can keep the pipe open, so draining is bounded.
    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    let mut drained = stdout_closed;
    while !drained {
        let wait = drain_deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(line) => take_line(line, &mut collected),
            Err(RecvTimeoutError::Disconnected) => drained = true,
            Err(RecvTimeoutError::Timeout) => {
                warn!("stdout still open after child exit, abandoning reader");
                break;
            }
        }
    }
    if drained {
        join_output(stdout_handle).context("join stdout")?;
    }
    let (stderr, stderr_truncated) = match join_within(stderr_handle, drain_deadline) {
        Some(result) => result.context("join stderr")?,
        None => {
            warn!("stderr still open after child exit, abandoning reader");
            (Vec::new(), 0)
        }
    };

    let (stdout, stdout_truncated) = collected.into_parts();
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn spawn_piped(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<Child> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Written from a thread so a child that talks before reading cannot stall us.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }
    Ok(child)
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    send_sigterm(child);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for command after SIGTERM")?
    {
        return Ok(status);
    }
    warn!(grace_secs = grace.as_secs(), "child ignored SIGTERM, killing");
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    let pid = child.id().to_string();
    match Command::new("kill")
        .args(["-TERM", &pid])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pid, "sent SIGTERM"),
        Ok(status) => debug!(pid, exit_code = ?status.code(), "kill -TERM failed"),
        Err(e) => warn!(pid, err = %e, "failed to run kill"),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) {}

fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<Vec<u8>>) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 || tx.send(line).is_err() {
            return Ok(());
        }
    }
}

fn append_limited(collected: &mut Vec<u8>, truncated: &mut usize, chunk: &[u8], limit: usize) {
    let remaining = limit.saturating_sub(collected.len());
    let keep = chunk.len().min(remaining);
    collected.extend_from_slice(&chunk[..keep]);
    *truncated += chunk.len() - keep;
}

/// Newest whole lines of a stream within `limit` bytes. Older lines are
/// dropped from the front and counted. The last line is kept even if it alone
/// exceeds the limit.
struct LineTail {
    lines: VecDeque<Vec<u8>>,
    bytes: usize,
    dropped: usize,
    limit: usize,
}

impl LineTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            dropped: 0,
            limit,
        }
    }

    fn push(&mut self, line: Vec<u8>) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len();
                self.dropped += old.len();
            }
        }
    }

    fn into_parts(self) -> (Vec<u8>, usize) {
        (self.lines.into_iter().flatten().collect(), self.dropped)
    }
}

/// Join `handle` if it finishes before `deadline`; otherwise leave it detached.
fn join_within<T>(
    handle: thread::JoinHandle<Result<T>>,
    deadline: Instant,
) -> Option<Result<T>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(20));
    }
    Some(match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    })
}

fn join_output<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        append_limited(&mut buf, &mut truncated, &chunk[..n], limit);
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn limits(timeout: Duration) -> StreamLimits {
        StreamLimits {
            timeout,
            output_limit_bytes: 1024,
            kill_grace: Duration::from_secs(1),
        }
    }

    #[test]
    fn streams_lines_in_order() {
        let mut seen = Vec::new();
        let output = run_command_streaming(
            sh("printf 'one\\ntwo\\nthree'"),
            None,
            limits(Duration::from_secs(10)),
            &CancelFlag::new(),
            |line| seen.push(line.to_string()),
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(output.stdout, b"one\ntwo\nthree");
        assert!(!output.timed_out && !output.cancelled);
    }

    #[test]
    fn stdin_reaches_child() {
        let mut seen = Vec::new();
        run_command_streaming(
            Command::new("cat"),
            Some(b"prompt text\n"),
            limits(Duration::from_secs(10)),
            &CancelFlag::new(),
            |line| seen.push(line.to_string()),
        )
        .expect("run");
        assert_eq!(seen, vec!["prompt text"]);
    }

    #[test]
    fn timeout_terminates_child() {
        let started = Instant::now();
        let output = run_command_streaming(
            sh("echo started; exec sleep 30"),
            None,
            limits(Duration::from_millis(300)),
            &CancelFlag::new(),
            |_| {},
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancel_flag_stops_child() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let output = run_command_streaming(
            sh("echo ready; exec sleep 30"),
            None,
            limits(Duration::from_secs(60)),
            &cancel,
            move |line| {
                if line == "ready" {
                    trigger.cancel();
                }
            },
        )
        .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let output = run_command_with_timeout(
            sh("head -c 3000 /dev/zero"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert_eq!(output.stdout.len(), 1000);
        assert_eq!(output.stdout_truncated, 2000);
        assert!(output.stdout_truncated_notice("verify").contains("2000 bytes"));
    }

    #[test]
    fn streamed_output_keeps_newest_whole_lines() {
        let mut seen = 0;
        let output = run_command_streaming(
            sh("for i in $(seq 1 100); do echo \"noise line $i with some padding text\"; done; \
                echo '<<<FIX_SUMMARY_END>>>'"),
            None,
            limits(Duration::from_secs(10)),
            &CancelFlag::new(),
            |_| seen += 1,
        )
        .expect("run");
        assert_eq!(seen, 101);
        assert!(output.stdout.len() <= 1024);
        assert!(output.stdout_truncated > 0);
        let text = String::from_utf8(output.stdout).expect("utf8");
        assert!(text.starts_with("noise line "), "{text}");
        assert!(text.ends_with("<<<FIX_SUMMARY_END>>>\n"));
        assert!(text.contains("noise line 100 "));
    }

    #[test]
    fn line_tail_keeps_an_oversized_last_line() {
        let mut tail = LineTail::new(4);
        tail.push(b"ab\n".to_vec());
        tail.push(b"0123456789\n".to_vec());
        let (kept, dropped) = tail.into_parts();
        assert_eq!(kept, b"0123456789\n");
        assert_eq!(dropped, 3);
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let output = run_command_with_timeout(
            sh("printf 'a\\nb\\nc\\n' >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr_tail(2), "b\nc");
    }
}
