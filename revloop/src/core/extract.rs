//! Extraction of the single trusted decision block from agent output.
//!
//! Candidate families are searched in a fixed order and the first family that
//! yields a valid, correctly-typed object wins:
//!
//! 1. role delimiters (`<<<REVIEW_SUMMARY_START>>>` ... `<<<REVIEW_SUMMARY_END>>>`),
//! 2. fenced code blocks labeled `json`,
//! 3. a bare JSON object ending at the last `}` of the text.
//!
//! Within a family the last candidate in document order is authoritative;
//! earlier ones are only consulted when later ones are rejected. Each candidate
//! is parsed strictly, then once more after [`repair_json`], then validated
//! against the JSON Schema of the requested [`DecisionKind`].

use std::fmt;
use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::decision::{FixSummary, ReviewSummary, StructuredDecision};
use crate::core::repair::repair_json;
use crate::core::stream::{MessageRole, StreamEvent, extract_result, parser_for};
use crate::core::types::{AgentKind, DecisionKind, Role};

const REVIEW_SCHEMA: &str = include_str!("../../schemas/review_summary.schema.json");
const FIX_SCHEMA: &str = include_str!("../../schemas/fix_summary.schema.json");

static REVIEW_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(REVIEW_SCHEMA));
static FIX_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(FIX_SCHEMA));

static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```json[ \t]*\r?\n(.*?)```").expect("fenced block regex is valid")
});

fn compile_schema(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema is valid JSON");
    jsonschema::validator_for(&schema).expect("embedded schema compiles")
}

/// Candidate family a decision was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Delimited,
    Fenced,
    Bare,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Delimited => "delimited",
            Source::Fenced => "fenced",
            Source::Bare => "bare",
        }
    }
}

/// Winning candidate of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub source: Source,
    pub used_repair: bool,
    pub decision: StructuredDecision,
}

/// No family yielded a valid decision of the requested kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFailure {
    pub reason: String,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no valid decision block: {}", self.reason)
    }
}

impl std::error::Error for ExtractionFailure {}

pub type ExtractionResult = Result<Extraction, ExtractionFailure>;

/// Extract the decision block for `role` from `text`.
pub fn extract(text: &str, role: Role) -> ExtractionResult {
    let kind = role.decision_kind();
    let mut reasons = Vec::with_capacity(3);

    let families: [(Source, Vec<&str>); 3] = [
        (Source::Delimited, delimited_candidates(text, role)),
        (Source::Fenced, fenced_candidates(text)),
        (Source::Bare, bare_candidate(text).into_iter().collect()),
    ];

    for (source, candidates) in families {
        if candidates.is_empty() {
            reasons.push(format!("{}: {}", source.as_str(), empty_reason(source)));
            continue;
        }
        let mut last_error = None;
        for candidate in candidates.iter().rev() {
            match evaluate(candidate, kind) {
                Ok((decision, used_repair)) => {
                    return Ok(Extraction {
                        source,
                        used_repair,
                        decision,
                    });
                }
                Err(err) => {
                    if last_error.is_none() {
                        last_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = last_error {
            let noun = match source {
                Source::Delimited => "delimited block",
                Source::Fenced => "fenced block",
                Source::Bare => "trailing object",
            };
            let mut reason = format!("{}: {noun} {err}", source.as_str());
            if candidates.len() > 1 {
                reason.push_str(&format!(" ({} candidates rejected)", candidates.len()));
            }
            reasons.push(reason);
        }
    }

    Err(ExtractionFailure {
        reason: reasons.join("; "),
    })
}

/// Extract a decision from a raw agent transcript.
///
/// Tries the agent's final result text first, then the concatenated assistant
/// message text, then the raw transcript itself. The first text that yields a
/// decision wins; otherwise the failure for the preferred text is returned.
pub fn extract_from_transcript(agent: AgentKind, transcript: &str, role: Role) -> ExtractionResult {
    let mut texts: Vec<String> = Vec::with_capacity(3);
    if let Some(result) = extract_result(agent, transcript) {
        texts.push(result);
    }
    let assistant = assistant_text(agent, transcript);
    if !assistant.trim().is_empty() && !texts.contains(&assistant) {
        texts.push(assistant);
    }
    texts.push(transcript.to_string());

    let mut first_failure = None;
    for text in &texts {
        match extract(text, role) {
            Ok(extraction) => return Ok(extraction),
            Err(failure) => {
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }
    }
    Err(first_failure.unwrap_or_else(|| ExtractionFailure {
        reason: "empty transcript".to_string(),
    }))
}

fn assistant_text(agent: AgentKind, transcript: &str) -> String {
    let mut parser = parser_for(agent);
    let mut out = String::new();
    let mut streamed_block = false;
    for line in transcript.lines() {
        let Some(StreamEvent::Message {
            role: MessageRole::Assistant,
            content,
            is_delta,
        }) = parser.parse_line(line)
        else {
            continue;
        };
        if is_delta {
            streamed_block = true;
            out.push_str(&content);
        } else if streamed_block {
            // End event repeats what the deltas already delivered.
            streamed_block = false;
        } else {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&content);
        }
    }
    out
}

#[derive(Debug)]
enum CandidateError {
    InvalidJson(String),
    NotObject,
    WrongKind { found: DecisionKind },
    Schema(String),
}

impl fmt::Display for CandidateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateError::InvalidJson(err) => write!(f, "invalid JSON ({err})"),
            CandidateError::NotObject => f.write_str("is not a JSON object"),
            CandidateError::WrongKind { found } => {
                write!(f, "has wrong kind (found {})", found.as_str())
            }
            CandidateError::Schema(err) => write!(f, "failed schema validation ({err})"),
        }
    }
}

fn evaluate(candidate: &str, kind: DecisionKind) -> Result<(StructuredDecision, bool), CandidateError> {
    let (value, used_repair) = match serde_json::from_str::<Value>(candidate) {
        Ok(value) => (value, false),
        Err(strict_err) => match serde_json::from_str::<Value>(&repair_json(candidate)) {
            Ok(value) => (value, true),
            Err(_) => return Err(CandidateError::InvalidJson(strict_err.to_string())),
        },
    };
    if !value.is_object() {
        return Err(CandidateError::NotObject);
    }

    let (validator, other, other_kind) = match kind {
        DecisionKind::Review => (&*REVIEW_VALIDATOR, &*FIX_VALIDATOR, DecisionKind::Fix),
        DecisionKind::Fix => (&*FIX_VALIDATOR, &*REVIEW_VALIDATOR, DecisionKind::Review),
    };
    if !validator.is_valid(&value) {
        if other.is_valid(&value) {
            return Err(CandidateError::WrongKind { found: other_kind });
        }
        let messages: Vec<String> = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        return Err(CandidateError::Schema(messages.join("; ")));
    }

    let decision = match kind {
        DecisionKind::Review => serde_json::from_value::<ReviewSummary>(value)
            .map(StructuredDecision::Review)
            .map_err(|err| CandidateError::Schema(err.to_string()))?,
        DecisionKind::Fix => serde_json::from_value::<FixSummary>(value)
            .map(StructuredDecision::Fix)
            .map_err(|err| CandidateError::Schema(err.to_string()))?,
    };
    Ok((decision, used_repair))
}

fn empty_reason(source: Source) -> &'static str {
    match source {
        Source::Delimited => "no delimited block found",
        Source::Fenced => "no fenced json block found",
        Source::Bare => "no trailing JSON object found",
    }
}

fn delimited_candidates(text: &str, role: Role) -> Vec<&str> {
    let (start, end) = role.delimiters();
    let mut candidates = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = text[cursor..].find(start) {
        let body_start = cursor + offset + start.len();
        let Some(end_offset) = text[body_start..].find(end) else {
            break;
        };
        let body = &text[body_start..body_start + end_offset];
        if let Some(object) = outer_braces(body) {
            candidates.push(object);
        }
        cursor = body_start + end_offset + end.len();
    }
    candidates
}

fn fenced_candidates(text: &str) -> Vec<&str> {
    FENCED_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|body| !body.is_empty())
        .collect()
}

/// Slice from the first `{` to the last `}`, tolerating fences or prose around it.
fn outer_braces(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

/// The outermost object that closes at the last `}` in `text`.
fn bare_candidate(text: &str) -> Option<&str> {
    let end = text.rfind('}')?;
    let opens: Vec<usize> = text[..end]
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .map(|(i, _)| i)
        .collect();
    for &start in &opens {
        if matching_close(text, start, true) == Some(end) {
            return Some(&text[start..=end]);
        }
    }
    // Malformed strings confuse the string-aware scan; fall back to raw braces.
    for &start in &opens {
        if matching_close(text, start, false) == Some(end) {
            return Some(&text[start..=end]);
        }
    }
    None
}

fn matching_close(text: &str, start: usize, string_aware: bool) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if string_aware => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decision::FixDecision;

    const REVIEW_JSON: &str = r#"{"findings": [{"id": 1, "title": "Null deref", "priority": "P1", "evidence": "src/lib.rs:10 unwraps None"}], "overall_correctness": "patch is incorrect", "overall_explanation": "crash on empty input", "overall_confidence_score": 0.8}"#;
    const CLEAN_REVIEW_JSON: &str = r#"{"findings": [], "overall_correctness": "patch is correct", "overall_explanation": "looks good", "overall_confidence_score": 0.9}"#;
    const FIX_JSON: &str = r#"{"decision": "NO_CHANGES_NEEDED", "stop_iteration": true, "fixes": [], "skipped": []}"#;

    fn delimited(role: Role, json: &str) -> String {
        let (start, end) = role.delimiters();
        format!("{start}\n{json}\n{end}")
    }

    #[test]
    fn delimited_block_is_extracted_without_repair() {
        let text = format!(
            "I reviewed the diff.\n{}\n",
            delimited(Role::Reviewer, REVIEW_JSON)
        );
        let extraction = extract(&text, Role::Reviewer).expect("extract");
        assert_eq!(extraction.source, Source::Delimited);
        assert!(!extraction.used_repair);
        let review = extraction.decision.into_review().expect("review");
        assert_eq!(review.findings.len(), 1);
        assert_eq!(review.findings[0].id, 1);
    }

    #[test]
    fn stray_quote_is_repaired() {
        let broken = r#"{"findings": [{"id": 3, "title": "Quote", "priority": "P2", "evidence": "uses "raw" pointer"}], "overall_correctness": "patch is incorrect", "overall_explanation": "x", "overall_confidence_score": 0.5}"#;
        let text = delimited(Role::Reviewer, broken);
        let extraction = extract(&text, Role::Reviewer).expect("extract");
        assert!(extraction.used_repair);
        assert_eq!(extraction.source, Source::Delimited);
        let review = extraction.decision.into_review().expect("review");
        assert_eq!(review.findings[0].evidence, "uses \"raw\" pointer");
    }

    #[test]
    fn zero_candidates_names_every_family() {
        let failure = extract("No JSON here, just prose.", Role::Fixer).unwrap_err();
        assert!(failure.reason.contains("delimited: no delimited block found"));
        assert!(failure.reason.contains("fenced: no fenced json block found"));
        assert!(failure.reason.contains("bare: no trailing JSON object found"));
    }

    #[test]
    fn later_block_wins() {
        let text = format!(
            "{}\n...more work...\n{}",
            delimited(Role::Reviewer, REVIEW_JSON),
            delimited(Role::Reviewer, CLEAN_REVIEW_JSON)
        );
        let review = extract(&text, Role::Reviewer)
            .expect("extract")
            .decision
            .into_review()
            .expect("review");
        assert!(!review.has_issues());
        assert_eq!(review.overall_explanation, "looks good");
    }

    #[test]
    fn invalid_later_block_falls_back_to_earlier_one() {
        let text = format!(
            "{}\n{}",
            delimited(Role::Reviewer, REVIEW_JSON),
            delimited(Role::Reviewer, "{\"findings\": [}")
        );
        let extraction = extract(&text, Role::Reviewer).expect("extract");
        assert_eq!(extraction.source, Source::Delimited);
        assert!(extraction.decision.into_review().expect("review").has_issues());
    }

    #[test]
    fn wrong_kind_is_rejected_and_search_continues() {
        let text = format!(
            "```json\n{CLEAN_REVIEW_JSON}\n```\n{}",
            delimited(Role::Reviewer, FIX_JSON)
        );
        let extraction = extract(&text, Role::Reviewer).expect("extract");
        assert_eq!(extraction.source, Source::Fenced);
        assert!(matches!(extraction.decision, StructuredDecision::Review(_)));

        let failure = extract(&delimited(Role::Reviewer, FIX_JSON), Role::Reviewer).unwrap_err();
        assert!(failure.reason.contains("wrong kind (found fix summary)"));
    }

    #[test]
    fn fenced_block_invalid_json_is_reported() {
        let failure = extract("```json\n{not json at all\n```", Role::Fixer).unwrap_err();
        assert!(failure.reason.contains("fenced: fenced block invalid JSON"));
    }

    #[test]
    fn bare_trailing_object_is_found_after_prose() {
        let text = format!("Done. Summary follows {{ignored}}\n{FIX_JSON}\n");
        let extraction = extract(&text, Role::Fixer).expect("extract");
        assert_eq!(extraction.source, Source::Bare);
        let fix = extraction.decision.into_fix().expect("fix");
        assert_eq!(fix.decision, FixDecision::NoChangesNeeded);
        assert_eq!(fix.stop_iteration, Some(true));
    }

    #[test]
    fn delimiters_of_other_roles_are_ignored() {
        let text = delimited(Role::Fixer, FIX_JSON);
        let extraction = extract(&text, Role::CodeSimplifier).expect("extract");
        // Falls through to the bare family, which still finds the object.
        assert_eq!(extraction.source, Source::Bare);
    }

    #[test]
    fn transcript_extraction_prefers_final_result_text() {
        let result_text = delimited(Role::Fixer, FIX_JSON);
        let line = serde_json::json!({"type": "result", "subtype": "success", "result": result_text});
        let transcript = format!("{{\"type\":\"system\",\"subtype\":\"init\"}}\n{line}\n");
        let extraction =
            extract_from_transcript(AgentKind::Claude, &transcript, Role::Fixer).expect("extract");
        assert_eq!(extraction.source, Source::Delimited);
        assert!(!extraction.used_repair);
    }
}
