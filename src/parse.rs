//! Model response interpretation
//!
//! The model is asked for JSON, but what comes back ranges from clean JSON to
//! fenced JSON with prose around it to a bare diff to nothing usable at all.
//! Responses are first classified into one of three shapes, then extraction
//! runs per shape; garbage in means zero candidates out, never an error.

use crate::diff;
use crate::strategy::Strategy;
use serde::Deserialize;
use std::path::PathBuf;

/// One model-proposed fix, ready for validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchCandidate {
    /// Target file, relative to the repository root.
    pub file_path: PathBuf,
    /// Unified diff body.
    pub diff: String,
    /// Model's own description of the change, if it gave one.
    pub summary: Option<String>,
    /// Strategy that produced this candidate.
    pub strategy: Strategy,
}

/// Shape of a model response, decided before any extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// A JSON object carrying a `patches` array or single `patch`.
    Structured(Vec<StructuredPatch>),
    /// One or more bare unified-diff blocks, possibly wrapped in prose.
    RawDiffBlocks(Vec<String>),
    /// Nothing recognizable.
    Unparseable,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StructuredPatch {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub diff_content: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Deserialize)]
struct PatchesEnvelope {
    patches: Vec<StructuredPatch>,
}

#[derive(Deserialize)]
struct SinglePatchEnvelope {
    patch: StructuredPatch,
}

/// Classify a raw response into one of the three shapes.
pub fn classify(raw: &str) -> ParsedResponse {
    let cleaned = strip_code_fences(raw);

    if let Some(json) = extract_json_object(cleaned) {
        if let Some(patches) = parse_patch_json(json) {
            return ParsedResponse::Structured(patches);
        }
    }

    let blocks = diff::split_file_diffs(cleaned);
    if !blocks.is_empty() {
        return ParsedResponse::RawDiffBlocks(blocks);
    }

    ParsedResponse::Unparseable
}

/// Turn a raw model response into validated-shape candidates. Candidates whose
/// body is not structurally a unified diff are dropped here so the validator
/// only ever sees diff-shaped input.
pub fn interpret(raw: &str, strategy: Strategy) -> Vec<PatchCandidate> {
    match classify(raw) {
        ParsedResponse::Structured(patches) => patches
            .into_iter()
            .filter_map(|p| candidate_from_structured(p, strategy))
            .collect(),
        ParsedResponse::RawDiffBlocks(blocks) => blocks
            .into_iter()
            .filter_map(|b| candidate_from_block(&b, strategy))
            .collect(),
        ParsedResponse::Unparseable => Vec::new(),
    }
}

fn candidate_from_structured(patch: StructuredPatch, strategy: Strategy) -> Option<PatchCandidate> {
    let body = normalize_diff_body(&patch.diff_content);
    if !diff::looks_like_diff(&body) {
        return None;
    }

    let file_path = if patch.file_path.trim().is_empty() {
        path_from_diff(&body)?
    } else {
        PathBuf::from(patch.file_path.trim())
    };

    Some(PatchCandidate {
        file_path,
        diff: body,
        summary: patch.summary.filter(|s| !s.trim().is_empty()),
        strategy,
    })
}

fn candidate_from_block(block: &str, strategy: Strategy) -> Option<PatchCandidate> {
    let body = normalize_diff_body(block);
    if !diff::looks_like_diff(&body) {
        return None;
    }
    let file_path = path_from_diff(&body)?;

    Some(PatchCandidate {
        file_path,
        diff: body,
        summary: None,
        strategy,
    })
}

fn path_from_diff(body: &str) -> Option<PathBuf> {
    diff::parse_unified_diff(body)
        .ok()
        .map(|d| d.target_path())
}

/// Trim prose before and after the diff and make sure the body ends with a
/// newline (git rejects patches that don't). Interior lines are kept exactly
/// as the model emitted them: a content line with a missing prefix must
/// reach the validator and come back as git's own error, not be silently
/// dropped here.
fn normalize_diff_body(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let Some(start) = lines
        .iter()
        .position(|l| l.starts_with("diff --git") || l.starts_with("--- "))
    else {
        return String::new();
    };

    let is_diff_line = |line: &&str| {
        line.starts_with("diff ")
            || line.starts_with("index ")
            || line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("@@")
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with(' ')
            || line.starts_with('\\')
    };
    let Some(end) = lines.iter().rposition(is_diff_line) else {
        return String::new();
    };
    if end < start {
        return String::new();
    }

    let mut body = lines[start..=end].join("\n");
    body.push('\n');
    body
}

/// Strip ``` fences (with or without a language tag) around a response.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = if let Some(rest) = trimmed.strip_prefix("```") {
        match rest.split_once('\n') {
            Some((_lang, body)) => body,
            None => rest,
        }
    } else {
        trimmed
    };
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Find the first balanced `{...}` object in the text.
fn extract_json_object(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[open..].char_indices() {
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
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..open + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_patch_json(json: &str) -> Option<Vec<StructuredPatch>> {
    if let Some(patches) = try_parse_envelopes(json) {
        return Some(patches);
    }
    // Retry once with common model-introduced JSON damage smoothed out.
    try_parse_envelopes(&fix_json_issues(json))
}

fn try_parse_envelopes(json: &str) -> Option<Vec<StructuredPatch>> {
    if let Ok(envelope) = serde_json::from_str::<PatchesEnvelope>(json) {
        return Some(envelope.patches);
    }
    if let Ok(envelope) = serde_json::from_str::<SinglePatchEnvelope>(json) {
        return Some(vec![envelope.patch]);
    }
    None
}

/// Fix common JSON issues in model output: trailing commas, smart quotes,
/// stray control characters.
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
