//! Shared deterministic types for the review loop.
//!
//! These types define stable contracts between core components and the I/O
//! layer. Serialized names are part of the session log format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent role invoked by the cycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Reviewer,
    Fixer,
    CodeSimplifier,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reviewer => "reviewer",
            Role::Fixer => "fixer",
            Role::CodeSimplifier => "code-simplifier",
        }
    }

    /// Kind of structured decision this role must emit.
    pub fn decision_kind(self) -> DecisionKind {
        match self {
            Role::Reviewer => DecisionKind::Review,
            Role::Fixer | Role::CodeSimplifier => DecisionKind::Fix,
        }
    }

    /// START/END tokens wrapping the role's decision block.
    pub fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            Role::Reviewer => ("<<<REVIEW_SUMMARY_START>>>", "<<<REVIEW_SUMMARY_END>>>"),
            Role::Fixer => ("<<<FIX_SUMMARY_START>>>", "<<<FIX_SUMMARY_END>>>"),
            Role::CodeSimplifier => ("<<<SIMPLIFY_SUMMARY_START>>>", "<<<SIMPLIFY_SUMMARY_END>>>"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reviewer" => Ok(Role::Reviewer),
            "fixer" => Ok(Role::Fixer),
            "code-simplifier" | "simplifier" => Ok(Role::CodeSimplifier),
            other => Err(format!(
                "unknown role '{other}' (expected reviewer, fixer, code-simplifier)"
            )),
        }
    }
}

/// Which structured decision schema applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Review,
    Fix,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Review => "review summary",
            DecisionKind::Fix => "fix summary",
        }
    }
}

/// Supported agent CLI families. Each speaks its own streaming protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Droid,
    Gemini,
    Opencode,
    Pi,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Droid,
        AgentKind::Gemini,
        AgentKind::Opencode,
        AgentKind::Pi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Droid => "droid",
            AgentKind::Gemini => "gemini",
            AgentKind::Opencode => "opencode",
            AgentKind::Pi => "pi",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = AgentKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown agent '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Cycle engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Idle,
    Reviewing,
    Checkpointing,
    Fixing,
    Deciding,
    Completed,
    Failed,
    Interrupted,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Idle => "idle",
            CycleStatus::Reviewing => "reviewing",
            CycleStatus::Checkpointing => "checkpointing",
            CycleStatus::Fixing => "fixing",
            CycleStatus::Deciding => "deciding",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
            CycleStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase an iteration error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Simplify,
    Review,
    Checkpoint,
    Fix,
    Verify,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Simplify => "simplify",
            Phase::Review => "review",
            Phase::Checkpoint => "checkpoint",
            Phase::Fix => "fix",
            Phase::Verify => "verify",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a rollback attempt, recorded on the iteration regardless of outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Fatal failure of one phase after retries were exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationError {
    pub phase: Phase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub attempts: u32,
}

impl fmt::Display for IterationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase failed after {} attempt(s): {}",
            self.phase, self.attempts, self.message
        )?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for IterationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_parses_all_names() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>(), Ok(kind));
        }
        let err = "cursor".parse::<AgentKind>().unwrap_err();
        assert!(err.contains("claude, codex, droid, gemini, opencode, pi"));
    }

    #[test]
    fn role_serializes_kebab_case() {
        let json = serde_json::to_string(&Role::CodeSimplifier).expect("serialize");
        assert_eq!(json, "\"code-simplifier\"");
        assert_eq!("simplifier".parse::<Role>(), Ok(Role::CodeSimplifier));
    }

    #[test]
    fn iteration_error_message_names_phase_attempts_and_error() {
        let err = IterationError {
            phase: Phase::Fix,
            message: "fixer exited with status 2".to_string(),
            exit_code: Some(2),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "fix phase failed after 3 attempt(s): fixer exited with status 2 (exit code 2)"
        );
    }
}
