//! Patch validation against the working tree
//!
//! The only test that matters is whether git will take the patch, so
//! validation is a dry-run `git apply --check` against the real checkout, not
//! a copy; earlier patches in the same run may already have changed the
//! file. The exact stderr is kept verbatim: it goes back to the model on
//! retry, and paraphrasing it loses the line number or token git complained
//! about.

use crate::diff;
use crate::parse::PatchCandidate;
use crate::util::{run_command_with_timeout, truncate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_TEXT_MAX_CHARS: usize = 1800;

/// Classified validation failure, used for strategy escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The diff itself is broken (corrupt hunks, missing headers, no content).
    MalformedDiff,
    /// The diff names a file the repository does not track.
    PathMismatch,
    /// The diff assumes surrounding lines that are not in the file.
    ContextMismatch,
    Other,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::MalformedDiff => "malformed-diff",
            ErrorKind::PathMismatch => "path-mismatch",
            ErrorKind::ContextMismatch => "context-mismatch",
            ErrorKind::Other => "other",
        }
    }
}

/// Outcome of checking one candidate. Not persisted beyond the attempt record
/// it informs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub applies: bool,
    /// Verbatim tool error text; empty on success.
    pub error: String,
    pub kind: Option<ErrorKind>,
    /// The patch applies but changes nothing.
    pub degenerate: bool,
    /// Set when the patch only applies after local hunk-header repair; this is
    /// the body that must be applied instead of the candidate's own.
    pub repaired_diff: Option<String>,
}

impl ValidationResult {
    fn pass(degenerate: bool, repaired_diff: Option<String>) -> Self {
        Self {
            applies: true,
            error: String::new(),
            kind: None,
            degenerate,
            repaired_diff,
        }
    }

    fn fail(error: String, kind: ErrorKind) -> Self {
        Self {
            applies: false,
            error,
            kind: Some(kind),
            degenerate: false,
            repaired_diff: None,
        }
    }
}

/// Classify a `git apply` error by its well-known phrases. This is the single
/// classifier; strategy escalation and trace records both go through it.
pub fn classify_apply_error(error: &str) -> ErrorKind {
    let lower = error.to_lowercase();

    if lower.contains("corrupt patch")
        || lower.contains("malformed")
        || lower.contains("unrecognized input")
        || lower.contains("fragment without header")
    {
        return ErrorKind::MalformedDiff;
    }
    if lower.contains("no such file or directory")
        || lower.contains("does not exist in index")
        || lower.contains("bad path")
        || lower.contains("not tracked")
    {
        return ErrorKind::PathMismatch;
    }
    if lower.contains("while searching for")
        || lower.contains("patch does not apply")
        || lower.contains("patch failed")
        || lower.contains("does not match index")
    {
        return ErrorKind::ContextMismatch;
    }
    ErrorKind::Other
}

/// Dry-run validator scoped to one repository root.
pub struct PatchValidator {
    repo_root: PathBuf,
}

impl PatchValidator {
    /// Open the validator for a repository. The root must exist and be inside
    /// a git work tree; both are checked here, before any retry loop starts.
    pub fn open(repo_root: &Path) -> anyhow::Result<Self> {
        let repo_root = repo_root
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("Repository root {}: {}", repo_root.display(), e))?;
        // Fails fast on a directory git does not recognize.
        git2::Repository::open(&repo_root)
            .map_err(|e| anyhow::anyhow!("Not a git repository: {}", e.message()))?;
        Ok(Self { repo_root })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Check whether a candidate would apply cleanly right now.
    pub fn validate(&self, candidate: &PatchCandidate) -> ValidationResult {
        // An empty body never reaches git.
        if candidate.diff.trim().is_empty() {
            return ValidationResult::fail("Empty diff content".to_string(), ErrorKind::MalformedDiff);
        }

        let structural = diff::format_errors(&candidate.diff);
        if !structural.is_empty() {
            return ValidationResult::fail(structural.join("; "), ErrorKind::MalformedDiff);
        }

        // A target outside the tracked tree is a path mismatch before git gets
        // a say; git's own message for this case is less direct.
        if !self.is_tracked(&candidate.file_path) {
            return ValidationResult::fail(
                format!(
                    "{}: not tracked in repository",
                    candidate.file_path.display()
                ),
                ErrorKind::PathMismatch,
            );
        }

        match self.git_apply(&candidate.diff, true) {
            Ok(()) => ValidationResult::pass(self.is_degenerate(&candidate.diff, candidate), None),
            Err(error) => {
                // A failed dry-run may just be a corrupt header; try the local
                // repair before burning an attempt on it. Repair runs only on
                // this fallback path, so a diff that already applied is never
                // rewritten.
                if let Some(repaired) = self.repaired_body(candidate) {
                    if self.git_apply(&repaired, true).is_ok() {
                        eprintln!(
                            "  Repaired hunk headers for {}",
                            candidate.file_path.display()
                        );
                        let degenerate = self.is_degenerate(&repaired, candidate);
                        return ValidationResult::pass(degenerate, Some(repaired));
                    }
                }
                let kind = classify_apply_error(&error);
                ValidationResult::fail(error, kind)
            }
        }
    }

    /// Apply a validated candidate for real, modifying the working tree.
    pub fn apply(&self, candidate: &PatchCandidate) -> anyhow::Result<()> {
        self.git_apply(&candidate.diff, false)
            .map_err(|e| anyhow::anyhow!("git apply failed: {}", e))
    }

    fn is_degenerate(&self, body: &str, candidate: &PatchCandidate) -> bool {
        let degenerate = diff::parse_unified_diff(body)
            .map(|d| d.is_noop())
            .unwrap_or(false);
        if degenerate {
            eprintln!(
                "  Warning: patch for {} applies but changes nothing",
                candidate.file_path.display()
            );
        }
        degenerate
    }

    /// Re-anchor and recount hunk headers against the file as it is now.
    /// Returns None when repair changed nothing.
    fn repaired_body(&self, candidate: &PatchCandidate) -> Option<String> {
        let file = self.repo_root.join(&candidate.file_path);
        let content = fs::read_to_string(&file).ok()?;
        let (body, repaired) = diff::repair_hunk_headers(&candidate.diff, &content);
        repaired.then_some(body)
    }

    fn is_tracked(&self, path: &Path) -> bool {
        let repo = match git2::Repository::open(&self.repo_root) {
            Ok(repo) => repo,
            Err(_) => return false,
        };
        let index = match repo.index() {
            Ok(index) => index,
            Err(_) => return false,
        };
        index.get_path(path, 0).is_some()
    }

    fn git_apply(&self, body: &str, check_only: bool) -> Result<(), String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.repo_root).arg("apply");
        if check_only {
            cmd.arg("--check");
        }
        cmd.arg("--verbose").arg("-");

        let result = run_command_with_timeout(&mut cmd, Some(body), GIT_APPLY_TIMEOUT)?;

        if result.timed_out {
            return Err("git apply timed out".to_string());
        }
        match result.status {
            Some(status) if status.success() => Ok(()),
            _ => {
                let combined = if result.stderr.trim().is_empty() {
                    result.stdout
                } else {
                    result.stderr
                };
                Err(truncate(combined.trim(), ERROR_TEXT_MAX_CHARS))
            }
        }
    }
}
