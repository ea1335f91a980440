//! Prompting strategies and selection
//!
//! The strategy set is fixed and known at compile time, so it is a closed enum
//! dispatched by match rather than a runtime registry of callables; there is
//! no "unregistered strategy" failure mode.
//!
//! Selection order on retries: error-kind escalation first (context mismatch
//! wants more context, malformed output wants a format repair), then the
//! two-consecutive-failures demotion that stops a structurally doomed batch
//! from eating the whole budget.

use crate::finding::{Category, Finding};
use crate::llm::Model;
use crate::memory::AgentMemory;
use crate::validator::ErrorKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One finding, minimal surrounding context, exactly one diff.
    SinglePatch,
    /// All findings in one file covered by one diff. Cheaper in tokens, less
    /// reliable for multi-hunk output.
    BatchPatch,
    /// One finding with an extended source window, for when the model's diff
    /// assumed surrounding lines that are not there.
    ContextualPatch,
    /// Re-emit a previously generated diff with fixed formatting, without
    /// re-deriving the fix.
    FormatRepair,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::SinglePatch => "single_patch",
            Strategy::BatchPatch => "batch_patch",
            Strategy::ContextualPatch => "contextual_patch",
            Strategy::FormatRepair => "format_repair",
        }
    }

    /// Which model tier runs this strategy. Repair is mechanical enough for
    /// the cheap tier.
    pub fn model(&self) -> Model {
        match self {
            Strategy::FormatRepair => Model::Repair,
            _ => Model::Patch,
        }
    }

    /// Strategies that work one finding at a time even for a group.
    pub fn per_finding(&self) -> bool {
        matches!(self, Strategy::SinglePatch | Strategy::ContextualPatch)
    }
}

/// Assessed difficulty of a finding group, driving the first-attempt choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Complexity from rule category and line span. Security findings and
/// single-line findings fix well with a minimal prompt; wide spans and long
/// messages need more care.
pub fn assess_complexity(finding: &Finding) -> Complexity {
    if finding.category == Category::Security {
        return Complexity::Simple;
    }
    let span = finding.location.line_span();
    if span > 5 || finding.message.len() > 200 {
        Complexity::Complex
    } else if span > 1 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}

/// Pick the strategy for the next attempt.
pub fn select_strategy(findings: &[Finding], memory: &AgentMemory) -> Strategy {
    if memory.attempts() == 0 {
        return first_attempt_strategy(findings);
    }

    // Escalate on what the validator actually said.
    match memory.last_error_kind() {
        Some(ErrorKind::ContextMismatch) => return Strategy::ContextualPatch,
        Some(ErrorKind::MalformedDiff) => return Strategy::FormatRepair,
        _ => {}
    }

    let previous = memory
        .last()
        .map(|r| r.strategy)
        .unwrap_or(Strategy::SinglePatch);

    // Same strategy failed twice in a row: stop repeating it.
    if memory.failed_twice_with(previous) {
        return match previous {
            Strategy::BatchPatch => Strategy::SinglePatch,
            _ => Strategy::SinglePatch,
        };
    }

    // After a transport error or an unclassified failure, a repair prompt has
    // nothing to repair; fall back to regenerating.
    match previous {
        Strategy::FormatRepair => Strategy::SinglePatch,
        other => other,
    }
}

fn first_attempt_strategy(findings: &[Finding]) -> Strategy {
    if findings.len() > 1 {
        return Strategy::BatchPatch;
    }
    match assess_complexity(&findings[0]) {
        Complexity::Complex => Strategy::ContextualPatch,
        _ => Strategy::SinglePatch,
    }
}
