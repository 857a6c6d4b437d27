//! The review/fix cycle: review, checkpoint, fix, decide, repeat.
//!
//! [`CycleEngine::run_cycle`] owns one run end to end. It takes the session
//! lock for `(project, branch)`, keeps it alive with a heartbeat, drives the
//! agents through the state machine and writes the session log. Every outcome,
//! including infrastructure failures, comes back as a [`CycleResult`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::decision::{FixSummary, ReviewSummary, StructuredDecision};
use crate::core::extract::extract_from_transcript;
use crate::core::outcome::{
    CycleVerdict, determine_cycle_result, fixer_stop_result, should_stop,
};
use crate::core::retry::{remaining_budget, retry_delay};
use crate::core::types::{CycleStatus, IterationError, Phase, Role, RollbackOutcome};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::{AgentConfig, EngineConfig};
use crate::io::git::{CheckpointHandle, Checkpointer};
use crate::io::heartbeat::HeartbeatMonitor;
use crate::io::lock::{
    Acquire, LockConflict, LockHandle, SessionInfo, SessionLock, normalize_branch,
    normalize_project_path,
};
use crate::io::process::CancelFlag;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::session_log::{
    AgentEntry, IterationEntry, LogEntry, ResultEntry, SessionLog, SystemEntry, new_session_id,
    session_name,
};
use crate::io::verify::{VerifyOutcome, VerifyRequest, Verifier, run_verify_if_configured};

/// Mode recorded in the lock file for engine runs.
pub const CYCLE_MODE: &str = "cycle";
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Live state of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleState {
    /// Completed or in-flight review iterations. Never reset within a run.
    pub iteration: u32,
    pub max_iterations: u32,
    pub status: CycleStatus,
    /// Last rollback performed, if any.
    pub rollback: Option<RollbackOutcome>,
}

/// Structured result of [`CycleEngine::run_cycle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleResult {
    pub success: bool,
    pub final_status: CycleStatus,
    pub reason: String,
    pub session_id: String,
    /// Session log, once one was created.
    pub session_path: Option<PathBuf>,
    pub iterations: u32,
    /// Set when another live session holds the lock.
    pub busy: Option<LockConflict>,
}

/// Why a phase produced no decision.
#[derive(Debug)]
enum PhaseFailure {
    Interrupted,
    Failed(IterationError),
}

/// Per-run mutable context.
struct RunContext {
    session_id: String,
    project: PathBuf,
    project_path: String,
    branch: Option<String>,
    lock: Arc<LockHandle>,
    heartbeat: HeartbeatMonitor,
    log: SessionLog,
    artifacts_dir: PathBuf,
    state: CycleState,
    history: Vec<String>,
    verify_failure: Option<String>,
    lock_lost: bool,
}

impl RunContext {
    fn lock_lost(&self) -> bool {
        self.lock_lost || self.heartbeat.is_lost()
    }
}

/// Drives review/fix iterations against injected agents, checkpointer and
/// verifier.
pub struct CycleEngine<'a, A, C, V> {
    config: &'a EngineConfig,
    agents: &'a A,
    checkpointer: &'a C,
    verifier: &'a V,
    cancel: CancelFlag,
    prompts: PromptBuilder,
}

impl<'a, A: AgentRunner, C: Checkpointer, V: Verifier> CycleEngine<'a, A, C, V> {
    pub fn new(
        config: &'a EngineConfig,
        agents: &'a A,
        checkpointer: &'a C,
        verifier: &'a V,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            agents,
            checkpointer,
            verifier,
            cancel,
            prompts: PromptBuilder::default(),
        }
    }

    /// Run the whole cycle for `project` on `branch`. Never fails: every
    /// outcome is reported in the returned [`CycleResult`].
    #[instrument(skip_all, fields(project = %project.display(), branch = ?branch))]
    pub fn run_cycle(&self, project: &Path, branch: Option<&str>) -> CycleResult {
        let session_id = new_session_id();
        let failed = |reason: String| CycleResult {
            success: false,
            final_status: CycleStatus::Failed,
            reason,
            session_id: session_id.clone(),
            session_path: None,
            iterations: 0,
            busy: None,
        };

        if let Err(e) = self.config.validate() {
            return failed(format!("invalid config: {e:#}"));
        }

        let mut ctx = match self.open_session(&session_id, project, branch) {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(conflict)) => {
                warn!(holder = %conflict.holder.session_id, "session lock busy");
                return CycleResult {
                    reason: conflict.to_string(),
                    busy: Some(conflict),
                    ..failed(String::new())
                };
            }
            Err(e) => {
                error!(err = %format!("{e:#}"), "could not start session");
                return failed(format!("could not start session: {e:#}"));
            }
        };

        let started = Instant::now();
        let verdict = self.run_iterations(&mut ctx);
        self.set_status(&mut ctx, verdict.status);
        info!(
            success = verdict.success,
            status = %verdict.status,
            reason = %verdict.reason,
            iterations = ctx.state.iteration,
            "cycle finished"
        );
        self.append(
            &ctx,
            &LogEntry::Result(ResultEntry {
                timestamp: Utc::now(),
                success: verdict.success,
                status: verdict.status,
                reason: verdict.reason.clone(),
                iterations: ctx.state.iteration,
                duration_ms: elapsed_ms(started),
            }),
        );

        let RunContext {
            lock,
            mut heartbeat,
            log,
            state,
            ..
        } = ctx;
        heartbeat.stop();
        if let Err(e) = lock.release() {
            warn!(err = %format!("{e:#}"), "failed to release session lock");
        }

        CycleResult {
            success: verdict.success,
            final_status: verdict.status,
            reason: verdict.reason,
            session_id,
            session_path: Some(log.path().to_path_buf()),
            iterations: state.iteration,
            busy: None,
        }
    }

    /// Take the lock, start the heartbeat, open the log.
    fn open_session(
        &self,
        session_id: &str,
        project: &Path,
        branch: Option<&str>,
    ) -> Result<Result<RunContext, LockConflict>> {
        let project_path = normalize_project_path(project);
        let branch = normalize_branch(branch);
        let logs_root = self.config.resolved_logs_root();
        let name = session_name(Path::new(&project_path), branch.as_deref());

        let locks = SessionLock::new(&logs_root, self.config.lock.clone());
        let info = SessionInfo {
            session_id: session_id.to_string(),
            session_name: name.clone(),
            mode: CYCLE_MODE.to_string(),
        };
        let lock = match locks.acquire(project, branch.as_deref(), &info)? {
            Acquire::Acquired(handle) => Arc::new(handle),
            Acquire::Conflict(conflict) => return Ok(Err(conflict)),
        };
        let heartbeat =
            HeartbeatMonitor::start(Arc::clone(&lock), self.config.lock.heartbeat_interval())?;

        let log = SessionLog::create(&logs_root, &project_path, session_id)?;
        let artifacts_dir = log.path().with_extension("");
        log.append(&LogEntry::System(SystemEntry {
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            session_name: name,
            project_path: project_path.clone(),
            branch: branch.clone(),
            max_iterations: self.config.max_iterations,
            reviewer: agent_entry(&self.config.reviewer),
            fixer: agent_entry(&self.config.fixer),
            simplifier: self.config.simplifier.as_ref().map(agent_entry),
        }))
        .context("write session header")?;
        info!(session_id, log = %log.path().display(), "session started");

        Ok(Ok(RunContext {
            session_id: session_id.to_string(),
            project: project.to_path_buf(),
            project_path,
            branch,
            lock,
            heartbeat,
            log,
            artifacts_dir,
            state: CycleState {
                iteration: 0,
                max_iterations: self.config.max_iterations,
                status: CycleStatus::Idle,
                rollback: None,
            },
            history: Vec::new(),
            verify_failure: None,
            lock_lost: false,
        }))
    }

    fn run_iterations(&self, ctx: &mut RunContext) -> CycleVerdict {
        let max = self.config.max_iterations;

        if self.config.simplifier.is_some() {
            if let Some(verdict) = self.run_simplifier(ctx) {
                return verdict;
            }
        }

        loop {
            if let Some(verdict) = self.halt_check(ctx) {
                return verdict;
            }
            if ctx.state.iteration >= max {
                return determine_cycle_result(true, ctx.state.iteration, max, false);
            }
            ctx.state.iteration += 1;
            let iteration = ctx.state.iteration;
            let started = Instant::now();
            let deadline = started + self.config.iteration_timeout();
            let mut entry = IterationEntry::new(iteration);
            info!(iteration, max, "iteration started");

            let outcome = self.run_iteration(ctx, &mut entry, deadline);
            entry.duration_ms = elapsed_ms(started);
            ctx.state.rollback = entry.rollback.clone().or(ctx.state.rollback.take());
            ctx.history.push(history_line(&entry));
            self.append(ctx, &LogEntry::Iteration(entry));
            if let Some(verdict) = outcome {
                return verdict;
            }
        }
    }

    /// One review/fix round. `Some` ends the cycle.
    fn run_iteration(
        &self,
        ctx: &mut RunContext,
        entry: &mut IterationEntry,
        deadline: Instant,
    ) -> Option<CycleVerdict> {
        let iteration = ctx.state.iteration;
        let max = self.config.max_iterations;

        self.set_status(ctx, CycleStatus::Reviewing);
        let review = match self
            .invoke(ctx, Role::Reviewer, &self.config.reviewer, None, deadline)
            .and_then(|decision| {
                decision
                    .into_review()
                    .ok_or_else(|| wrong_kind(Phase::Review))
            }) {
            Ok(review) => review,
            Err(failure) => return Some(self.phase_failed(ctx, entry, failure, None)),
        };
        let has_issues = review.has_issues();
        info!(iteration, findings = review.findings.len(), "review complete");
        entry.review = Some(review.clone());
        if !has_issues {
            return Some(determine_cycle_result(false, iteration, max, false));
        }
        if let Some(verdict) = self.halt_check(ctx) {
            return Some(verdict);
        }

        self.set_status(ctx, CycleStatus::Checkpointing);
        let checkpoint = match self.checkpointer.checkpoint() {
            Ok(handle) => handle,
            Err(e) => {
                let err = IterationError {
                    phase: Phase::Checkpoint,
                    message: format!("{e:#}"),
                    exit_code: None,
                    attempts: 1,
                };
                return Some(self.phase_failed(ctx, entry, PhaseFailure::Failed(err), None));
            }
        };

        self.set_status(ctx, CycleStatus::Fixing);
        let fix = match self
            .invoke(ctx, Role::Fixer, &self.config.fixer, Some(review), deadline)
            .and_then(|decision| decision.into_fix().ok_or_else(|| wrong_kind(Phase::Fix)))
        {
            Ok(fix) => fix,
            Err(failure) => {
                return Some(self.phase_failed(ctx, entry, failure, Some(&checkpoint)));
            }
        };
        info!(
            iteration,
            decision = ?fix.decision,
            fixes = fix.fixes.len(),
            skipped = fix.skipped.len(),
            "fix complete"
        );
        entry.fixes = Some(fix.clone());

        if !fix.fixes.is_empty() {
            if let Some(verdict) = self.verify_or_rollback(ctx, entry, &checkpoint, Phase::Verify) {
                return Some(verdict);
            }
            if entry.rollback.is_some() {
                // Verification failed; the round is lost but the run goes on.
                return None;
            }
        }

        self.set_status(ctx, CycleStatus::Deciding);
        if let Some(verdict) = self.halt_check(ctx) {
            return Some(verdict);
        }
        if should_stop(&fix) {
            let need_info = fix.need_info().count();
            debug!(iteration, need_info, "fixer ended the cycle");
            return Some(fixer_stop_result(need_info, iteration));
        }
        None
    }

    /// Optional pre-pass before the first review, logged as iteration 0.
    fn run_simplifier(&self, ctx: &mut RunContext) -> Option<CycleVerdict> {
        let agent = self.config.simplifier.as_ref()?;
        let started = Instant::now();
        let deadline = started + self.config.iteration_timeout();
        let mut entry = IterationEntry::new(0);
        let outcome = self.simplify(ctx, &mut entry, agent, deadline);
        entry.duration_ms = elapsed_ms(started);
        ctx.state.rollback = entry.rollback.clone();
        self.append(ctx, &LogEntry::Iteration(entry));
        outcome
    }

    fn simplify(
        &self,
        ctx: &mut RunContext,
        entry: &mut IterationEntry,
        agent: &AgentConfig,
        deadline: Instant,
    ) -> Option<CycleVerdict> {
        if let Some(verdict) = self.halt_check(ctx) {
            return Some(verdict);
        }
        self.set_status(ctx, CycleStatus::Checkpointing);
        let checkpoint = match self.checkpointer.checkpoint() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "checkpoint failed, skipping simplifier");
                entry.error = Some(IterationError {
                    phase: Phase::Checkpoint,
                    message: format!("{e:#}"),
                    exit_code: None,
                    attempts: 1,
                });
                return None;
            }
        };

        self.set_status(ctx, CycleStatus::Fixing);
        match self.invoke(ctx, Role::CodeSimplifier, agent, None, deadline) {
            Ok(decision) => entry.simplifier = decision.into_fix(),
            Err(PhaseFailure::Interrupted) => {
                entry.rollback = Some(self.rollback(&checkpoint, "interrupted"));
                return Some(determine_cycle_result(true, 0, self.config.max_iterations, true));
            }
            Err(PhaseFailure::Failed(err)) => {
                // The pre-pass is best effort: undo it and go on to review.
                warn!(%err, "simplifier failed, rolling back");
                entry.rollback = Some(self.rollback(&checkpoint, &err.to_string()));
                entry.error = Some(err);
                return None;
            }
        }

        let changed = entry
            .simplifier
            .as_ref()
            .is_some_and(|summary| !summary.fixes.is_empty());
        if changed {
            return self.verify_or_rollback(ctx, entry, &checkpoint, Phase::Simplify);
        }
        None
    }

    /// Run the verification gate after an edit; roll back on failure. A failed
    /// verification or rollback only fails the iteration. `Some` means the run
    /// was interrupted.
    fn verify_or_rollback(
        &self,
        ctx: &mut RunContext,
        entry: &mut IterationEntry,
        checkpoint: &CheckpointHandle,
        phase: Phase,
    ) -> Option<CycleVerdict> {
        if self.cancel.is_cancelled() {
            entry.rollback = Some(self.rollback(checkpoint, "interrupted"));
            return Some(self.interrupted(ctx));
        }
        let request = VerifyRequest {
            workdir: ctx.project.clone(),
            command: self.config.verify.command.clone(),
            log_path: ctx
                .artifacts_dir
                .join(format!("iter-{}-{}-verify.log", ctx.state.iteration, phase)),
            timeout: self.config.iteration_timeout(),
            output_limit_bytes: self.config.verify.output_limit_bytes,
        };
        let failure = match run_verify_if_configured(self.verifier, &request) {
            Ok(None | Some(VerifyOutcome::Passed)) => {
                ctx.verify_failure = None;
                return None;
            }
            Ok(Some(VerifyOutcome::Failed {
                exit_code,
                timed_out,
                tail,
            })) => {
                ctx.verify_failure = Some(tail);
                let message = if timed_out {
                    "verification timed out".to_string()
                } else {
                    "verification command failed".to_string()
                };
                IterationError {
                    phase: Phase::Verify,
                    message,
                    exit_code,
                    attempts: 1,
                }
            }
            Err(e) => IterationError {
                phase: Phase::Verify,
                message: format!("{e:#}"),
                exit_code: None,
                attempts: 1,
            },
        };
        warn!(%failure, "verification failed, rolling back");
        entry.rollback = Some(self.rollback(checkpoint, &failure.to_string()));
        entry.error = Some(failure);
        None
    }

    /// Record a phase whose retries ran out, rolling back when a checkpoint is
    /// pending. Ends the run; a failed rollback is added to the reason.
    fn phase_failed(
        &self,
        ctx: &mut RunContext,
        entry: &mut IterationEntry,
        failure: PhaseFailure,
        checkpoint: Option<&CheckpointHandle>,
    ) -> CycleVerdict {
        match failure {
            PhaseFailure::Interrupted => {
                if let Some(checkpoint) = checkpoint {
                    entry.rollback = Some(self.rollback(checkpoint, "interrupted"));
                }
                self.interrupted(ctx)
            }
            PhaseFailure::Failed(err) => {
                error!(%err, "phase failed");
                let reason = err.to_string();
                if let Some(checkpoint) = checkpoint {
                    entry.rollback = Some(self.rollback(checkpoint, &reason));
                }
                entry.error = Some(err);
                let reason = match entry.rollback.as_ref().filter(|r| !r.success) {
                    Some(rollback) => format!(
                        "{reason}; rollback failed: {}",
                        rollback.reason.as_deref().unwrap_or("unknown error")
                    ),
                    None => reason,
                };
                CycleVerdict {
                    success: false,
                    status: CycleStatus::Failed,
                    reason,
                }
            }
        }
    }

    fn rollback(&self, checkpoint: &CheckpointHandle, cause: &str) -> RollbackOutcome {
        match self.checkpointer.rollback(checkpoint) {
            Ok(()) => {
                info!(cause, "rolled back working tree");
                RollbackOutcome {
                    attempted: true,
                    success: true,
                    reason: Some(cause.to_string()),
                }
            }
            Err(e) => {
                error!(err = %format!("{e:#}"), cause, "rollback failed");
                RollbackOutcome {
                    attempted: true,
                    success: false,
                    reason: Some(format!("{cause}; {e:#}")),
                }
            }
        }
    }

    /// Invoke the agent for `role` until it yields a decision, retrying with
    /// backoff within the iteration deadline.
    fn invoke(
        &self,
        ctx: &RunContext,
        role: Role,
        agent: &AgentConfig,
        review: Option<ReviewSummary>,
        deadline: Instant,
    ) -> Result<StructuredDecision, PhaseFailure> {
        let phase = match role {
            Role::Reviewer => Phase::Review,
            Role::Fixer => Phase::Fix,
            Role::CodeSimplifier => Phase::Simplify,
        };
        let inputs = PromptInputs {
            project_path: ctx.project_path.clone(),
            branch: ctx.branch.clone(),
            iteration: ctx.state.iteration,
            max_iterations: self.config.max_iterations,
            review,
            history: ctx.history.clone(),
            verify_failure: ctx.verify_failure.clone(),
        };
        let fail = |message: String, exit_code: Option<i32>, attempts: u32| {
            PhaseFailure::Failed(IterationError {
                phase,
                message,
                exit_code,
                attempts,
            })
        };
        let prompt = self
            .prompts
            .build(role, &inputs)
            .map_err(|e| fail(format!("{e:#}"), None, 0))?;

        let mut attempts = 0;
        let mut last_error = String::from("no attempt made");
        let mut last_exit = None;
        for attempt in 0..=self.config.max_retries {
            if self.cancel.is_cancelled() {
                return Err(PhaseFailure::Interrupted);
            }
            let Some(remaining) = remaining_budget(deadline) else {
                last_error = format!("iteration timeout exhausted ({last_error})");
                break;
            };
            attempts += 1;
            let request = AgentRequest {
                role,
                agent: agent.clone(),
                workdir: ctx.project.clone(),
                prompt: prompt.clone(),
                timeout: remaining,
                output_limit_bytes: self.config.output_limit_bytes,
                kill_grace: self.config.kill_grace(),
                transcript_path: Some(ctx.artifacts_dir.join(format!(
                    "iter-{}-{}-{attempts}.jsonl",
                    ctx.state.iteration, role
                ))),
            };

            match self.agents.run(&request, &self.cancel) {
                Err(e) => {
                    last_error = format!("{e:#}");
                    last_exit = None;
                }
                Ok(run) if run.cancelled || self.cancel.is_cancelled() => {
                    return Err(PhaseFailure::Interrupted);
                }
                Ok(run) => match run.failure_message(agent.agent) {
                    Some(msg) => {
                        last_error = msg;
                        last_exit = run.exit_code;
                    }
                    None => match extract_from_transcript(agent.agent, &run.transcript, role) {
                        Ok(extraction) => {
                            debug!(
                                %role,
                                source = extraction.source.as_str(),
                                used_repair = extraction.used_repair,
                                "decision extracted"
                            );
                            return Ok(extraction.decision);
                        }
                        Err(failure) => {
                            last_error = failure.to_string();
                            last_exit = run.exit_code;
                        }
                    },
                },
            }
            warn!(%role, attempt = attempts, err = %last_error, "agent attempt failed");

            if attempt < self.config.max_retries {
                let delay = retry_delay(attempt, self.config.base_delay_ms, self.config.max_delay_ms);
                if !self.pause(delay, deadline) {
                    return Err(PhaseFailure::Interrupted);
                }
            }
        }
        Err(fail(last_error, last_exit, attempts))
    }

    /// Sleep up to `delay` (never past `deadline`). `false` when cancelled.
    fn pause(&self, delay: Duration, deadline: Instant) -> bool {
        let until = (Instant::now() + delay).min(deadline);
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Some(left) = until.checked_duration_since(Instant::now()) else {
                return true;
            };
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(PAUSE_SLICE));
        }
    }

    /// Cancellation and lock loss are checked at every phase boundary.
    fn halt_check(&self, ctx: &mut RunContext) -> Option<CycleVerdict> {
        if self.cancel.is_cancelled() {
            return Some(self.interrupted(ctx));
        }
        if ctx.lock_lost() {
            return Some(CycleVerdict {
                success: false,
                status: CycleStatus::Failed,
                reason: "session lock lost to another run".to_string(),
            });
        }
        None
    }

    fn interrupted(&self, ctx: &RunContext) -> CycleVerdict {
        determine_cycle_result(
            true,
            ctx.state.iteration,
            self.config.max_iterations,
            true,
        )
    }

    fn set_status(&self, ctx: &mut RunContext, status: CycleStatus) {
        ctx.state.status = status;
        match ctx.lock.set_state(status) {
            Ok(true) => {}
            Ok(false) => {
                warn!(%status, "session lock no longer ours");
                ctx.lock_lost = true;
            }
            Err(e) => warn!(err = %format!("{e:#}"), "failed to record state in lock"),
        }
    }

    fn append(&self, ctx: &RunContext, entry: &LogEntry) {
        if let Err(e) = ctx.log.append(entry) {
            warn!(
                session_id = %ctx.session_id,
                err = %format!("{e:#}"),
                "failed to write session log"
            );
        }
    }
}

fn wrong_kind(phase: Phase) -> PhaseFailure {
    PhaseFailure::Failed(IterationError {
        phase,
        message: "agent returned the wrong kind of decision".to_string(),
        exit_code: None,
        attempts: 1,
    })
}

fn agent_entry(agent: &AgentConfig) -> AgentEntry {
    AgentEntry {
        agent: agent.agent,
        model: agent.model.clone(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// One-line summary of an iteration for later prompts.
fn history_line(entry: &IterationEntry) -> String {
    let mut parts = vec![format!("iteration {}", entry.iteration)];
    if let Some(review) = &entry.review {
        parts.push(format!("{} finding(s)", review.findings.len()));
    }
    if let Some(fix) = &entry.fixes {
        parts.push(fix_line(fix));
    }
    if let Some(err) = &entry.error {
        parts.push(err.to_string());
    }
    match &entry.rollback {
        Some(rollback) if rollback.success => parts.push("changes rolled back".to_string()),
        Some(_) => parts.push("rollback failed, changes may remain".to_string()),
        None => {}
    }
    parts.join(": ")
}

fn fix_line(fix: &FixSummary) -> String {
    format!(
        "{} fixed, {} skipped ({} need info)",
        fix.fixes.len(),
        fix.skipped.len(),
        fix.need_info().count()
    )
}
