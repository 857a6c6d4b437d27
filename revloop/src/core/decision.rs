//! Structured decisions emitted by agents as their final output.
//!
//! The wire format is snake_case JSON validated against the embedded schemas in
//! `schemas/` before being deserialized into these types.

use serde::{Deserialize, Serialize};

/// Severity of a finding or fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

/// One issue reported by the reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: u32,
    pub title: String,
    pub priority: Priority,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub findings: Vec<Finding>,
    pub overall_correctness: String,
    pub overall_explanation: String,
    pub overall_confidence_score: f64,
}

impl ReviewSummary {
    pub fn has_issues(&self) -> bool {
        !self.findings.is_empty()
    }
}

/// Fixer's overall verdict on the review it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixDecision {
    NoChangesNeeded,
    ApplySelectively,
    ApplyMost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEntry {
    pub id: u32,
    pub title: String,
    pub priority: Priority,
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Why a finding was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipVerdict {
    Skip,
    NeedInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub id: u32,
    pub title: String,
    pub priority: Priority,
    pub reason: String,
    #[serde(default = "default_skip_verdict")]
    pub verdict: SkipVerdict,
}

fn default_skip_verdict() -> SkipVerdict {
    SkipVerdict::Skip
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSummary {
    pub decision: FixDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_iteration: Option<bool>,
    pub fixes: Vec<FixEntry>,
    #[serde(default)]
    pub skipped: Vec<SkippedEntry>,
}

impl FixSummary {
    /// Entries the fixer deferred pending more information.
    pub fn need_info(&self) -> impl Iterator<Item = &SkippedEntry> {
        self.skipped
            .iter()
            .filter(|entry| entry.verdict == SkipVerdict::NeedInfo)
    }
}

/// A validated decision of either kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StructuredDecision {
    Review(ReviewSummary),
    Fix(FixSummary),
}

impl StructuredDecision {
    pub fn into_review(self) -> Option<ReviewSummary> {
        match self {
            StructuredDecision::Review(review) => Some(review),
            StructuredDecision::Fix(_) => None,
        }
    }

    pub fn into_fix(self) -> Option<FixSummary> {
        match self {
            StructuredDecision::Fix(fix) => Some(fix),
            StructuredDecision::Review(_) => None,
        }
    }
}
