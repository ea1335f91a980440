//! Normalized static-analysis findings
//!
//! Findings arrive already deduplicated and severity-mapped from the tool
//! adapters; this module only defines the shape the agent consumes.
//!
//! Invariant: `Location::file` is always relative to the repository root.
//! Absolute or parent-traversing paths are rejected when a `Finding` is
//! constructed, because they corrupt `--- a/` / `+++ b/` diff headers once
//! they reach a prompt.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Severity of a finding as reported by the analysis tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// Broad category of the rule that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Correctness,
    Style,
    Import,
    Performance,
    Other,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Correctness => "correctness",
            Category::Style => "style",
            Category::Import => "import",
            Category::Performance => "performance",
            Category::Other => "other",
        }
    }
}

/// Where in the repository a finding points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the repository root.
    pub file: PathBuf,
    /// 1-indexed line number.
    pub line: usize,
    pub column: Option<usize>,
    pub end_line: Option<usize>,
    pub end_column: Option<usize>,
}

impl Location {
    /// Number of source lines the finding spans (at least 1).
    pub fn line_span(&self) -> usize {
        match self.end_line {
            Some(end) if end > self.line => end - self.line + 1,
            _ => 1,
        }
    }
}

/// One static-analysis issue, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FindingDraft")]
pub struct Finding {
    pub id: String,
    /// Tool-specific rule code, e.g. "E722" or "rust.lang.security.unsafe-usage".
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    pub category: Category,
    pub location: Location,
    /// Name of the tool that produced the finding.
    pub tool: String,
    pub suggested_fix: Option<String>,
}

/// Wire shape for a finding before the path invariant has been checked.
#[derive(Debug, Clone, Deserialize)]
pub struct FindingDraft {
    pub id: String,
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    pub category: Category,
    pub location: Location,
    pub tool: String,
    #[serde(default)]
    pub suggested_fix: Option<String>,
}

impl TryFrom<FindingDraft> for Finding {
    type Error = String;

    fn try_from(draft: FindingDraft) -> Result<Self, String> {
        Finding::new(draft)
    }
}

impl Finding {
    /// Validate the path invariant and construct the finding. This is the
    /// single normalization point; nothing downstream re-checks paths.
    pub fn new(draft: FindingDraft) -> Result<Self, String> {
        let file = normalize_relative_path(&draft.location.file)?;
        if draft.location.line == 0 {
            return Err(format!(
                "Finding {} has line 0; lines are 1-indexed",
                draft.id
            ));
        }

        Ok(Finding {
            id: draft.id,
            rule_id: draft.rule_id,
            message: draft.message,
            severity: draft.severity,
            category: draft.category,
            location: Location {
                file,
                ..draft.location
            },
            tool: draft.tool,
            suggested_fix: draft.suggested_fix,
        })
    }

    /// Absolute path of the finding's file under `repo_root`.
    pub fn path_in(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.location.file)
    }
}

/// Reject absolute and parent-traversing paths, normalize `./` prefixes.
fn normalize_relative_path(candidate: &Path) -> Result<PathBuf, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Finding path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed in findings: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed in findings: {}",
            candidate.display()
        ));
    }

    // Strip any leading `./` components so the same file always has one spelling.
    let normalized: PathBuf = candidate
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    if normalized.as_os_str().is_empty() {
        return Err(format!("Invalid finding path: {}", candidate.display()));
    }

    Ok(normalized)
}

#[cfg(test)]
pub(crate) fn test_finding(rule_id: &str, file: &str, line: usize) -> Finding {
    Finding::new(FindingDraft {
        id: format!("{}:{}:{}", rule_id, file, line),
        rule_id: rule_id.to_string(),
        message: "test finding".to_string(),
        severity: Severity::Warning,
        category: Category::Style,
        location: Location {
            file: PathBuf::from(file),
            line,
            column: Some(1),
            end_line: None,
            end_column: None,
        },
        tool: "ruff".to_string(),
        suggested_fix: None,
    })
    .unwrap()
}
