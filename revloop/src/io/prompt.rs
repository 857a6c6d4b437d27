//! Per-role prompt rendering with a byte budget.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the budget, droppable sections go first
//! and the largest section other than the output contract is truncated as a
//! final resort.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::decision::ReviewSummary;
use crate::core::types::Role;

const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const FIXER_TEMPLATE: &str = include_str!("prompts/fixer.md");
const SIMPLIFIER_TEMPLATE: &str = include_str!("prompts/simplifier.md");

pub const DEFAULT_PROMPT_BUDGET_BYTES: usize = 60_000;

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 2] = ["history", "verify"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Everything a role prompt may mention.
#[derive(Debug, Clone, Default)]
pub struct PromptInputs {
    pub project_path: String,
    pub branch: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Review the fixer acts on.
    pub review: Option<ReviewSummary>,
    /// One line per earlier iteration.
    pub history: Vec<String>,
    /// Tail of the last failed verification run.
    pub verify_failure: Option<String>,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders role prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        env.add_template("fixer", FIXER_TEMPLATE)
            .expect("fixer template should be valid");
        env.add_template("simplifier", SIMPLIFIER_TEMPLATE)
            .expect("simplifier template should be valid");
        Self { env, budget_bytes }
    }

    pub fn build(&self, role: Role, input: &PromptInputs) -> Result<String> {
        let name = match role {
            Role::Reviewer => "reviewer",
            Role::Fixer => "fixer",
            Role::CodeSimplifier => "simplifier",
        };
        let (start, end) = role.delimiters();
        let review = match &input.review {
            Some(review) => {
                Some(serde_json::to_string_pretty(review).context("serialize review for prompt")?)
            }
            None => None,
        };
        if role == Role::Fixer && review.is_none() {
            bail!("fixer prompt requires a review");
        }

        let rendered = self
            .env
            .get_template(name)?
            .render(context! {
                project_path => &input.project_path,
                branch => input.branch.as_deref(),
                iteration => input.iteration,
                max_iterations => input.max_iterations,
                review => review,
                history => &input.history,
                verify_failure => input.verify_failure.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                start => start,
                end => end,
            })
            .with_context(|| format!("render {name} prompt"))?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_BUDGET_BYTES)
    }
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[marker.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    // The output contract comes last and must survive intact, so shrink the
    // largest other section instead.
    let Some(victim) = sections
        .iter_mut()
        .filter(|s| s.key != "output")
        .max_by_key(|s| s.content.len())
    else {
        return;
    };
    let keep = victim
        .content
        .len()
        .saturating_sub(over + TRUNCATION_MARKER.len());
    let mut cut = keep;
    while !victim.content.is_char_boundary(cut) {
        cut -= 1;
    }
    let before = victim.content.len();
    victim.content.truncate(cut);
    victim.content.push_str(TRUNCATION_MARKER);
    debug!(section = %victim.key, before, after = victim.content.len(), "truncated prompt section");
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
