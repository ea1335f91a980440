//! Prompt assembly
//!
//! Builds the instruction sent to the model for each strategy. Composition is
//! deterministic: the same findings, file content, and feedback always yield
//! the same prompt. File paths are embedded exactly as they appear in the
//! finding, relative to the repository root, so they can flow straight into
//! `--- a/` / `+++ b/` headers.
//!
//! Validator errors are quoted verbatim in retry prompts. The exact line
//! number or token git complained about is what makes the retry work;
//! paraphrasing it measurably hurts.

use crate::context::{ContextReader, DEFAULT_CONTEXT_LINES, WIDE_CONTEXT_LINES};
use crate::finding::Finding;
use crate::strategy::Strategy;
use crate::validator::ErrorKind;
use std::path::Path;

/// System and user halves of one model request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptBundle {
    pub system: String,
    pub user: String,
}

/// What the previous attempt left behind.
#[derive(Debug, Clone, Copy)]
pub struct Feedback<'a> {
    /// Number of the attempt that failed.
    pub attempt: u32,
    /// Verbatim validator or transport error text.
    pub error: &'a str,
    pub kind: Option<ErrorKind>,
}

const SYSTEM_PROMPT: &str = r#"You are an expert developer fixing issues reported by static analysis tools. Your ONLY output is a JSON object carrying unified diff patches.

OUTPUT FORMAT (JSON):
{
  "patches": [
    {
      "file_path": "path/to/file.py",
      "diff_content": "--- a/path/to/file.py\n+++ b/path/to/file.py\n@@ -10,4 +10,4 @@\n ...",
      "summary": "Brief description of the change"
    }
  ]
}

UNIFIED DIFF REQUIREMENTS:
1. Start each diff with '--- a/<path>' and '+++ b/<path>' using the exact relative path given
2. Every hunk header '@@ -start,count +start,count @@' must carry the correct line numbers and line counts
3. Every content line must begin with '+', '-', or a single leading space
4. Never emit a '+' line with no content after it
5. Include about 3 unchanged context lines around each change
6. Make minimal changes that address only the reported issues
7. Preserve the file's existing style and indentation

Return only valid JSON, no additional text or formatting."#;

/// Builds prompts for all strategies.
pub struct PromptComposer {
    repo_root: std::path::PathBuf,
    context_lines: usize,
}

impl PromptComposer {
    pub fn new(repo_root: &Path, context_lines: usize) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            context_lines: if context_lines == 0 {
                DEFAULT_CONTEXT_LINES
            } else {
                context_lines
            },
        }
    }

    /// Compose the prompt for one attempt. `failed_patch` carries the previous
    /// diff body for the format-repair strategy.
    pub fn compose(
        &self,
        strategy: Strategy,
        findings: &[Finding],
        feedback: Option<Feedback<'_>>,
        failed_patch: Option<&str>,
    ) -> anyhow::Result<PromptBundle> {
        if findings.is_empty() {
            anyhow::bail!("No findings to compose a prompt for");
        }
        // The Finding constructor already rejects absolute paths; this is the
        // last line of defense before a path can reach a diff header.
        for finding in findings {
            if finding.location.file.is_absolute() {
                anyhow::bail!(
                    "Absolute path reached prompt composition: {}",
                    finding.location.file.display()
                );
            }
        }

        let user = match strategy {
            Strategy::SinglePatch => self.patch_prompt(&findings[0], DEFAULT_CONTEXT_LINES),
            Strategy::ContextualPatch => self.patch_prompt(&findings[0], WIDE_CONTEXT_LINES),
            Strategy::BatchPatch => self.batch_prompt(findings),
            Strategy::FormatRepair => self.repair_prompt(&findings[0], failed_patch),
        };

        let user = match feedback {
            Some(feedback) => format!("{}\n\n{}", feedback_section(feedback), user),
            None => user,
        };

        Ok(PromptBundle {
            system: SYSTEM_PROMPT.to_string(),
            user,
        })
    }

    fn patch_prompt(&self, finding: &Finding, window: usize) -> String {
        let window = window.max(self.context_lines);
        let reader = ContextReader::new(window);
        let context = reader.window(&self.repo_root, finding);

        let mut prompt = format!(
            "Fix this static analysis finding.\n\n\
             File: {}\n\
             Rule: {} ({})\n\
             Line {}: {}\n",
            finding.location.file.display(),
            finding.rule_id,
            finding.tool,
            finding.location.line,
            finding.message,
        );

        if let Some(fix) = &finding.suggested_fix {
            prompt.push_str(&format!("Suggested fix: {}\n", fix));
        }

        if !context.is_empty() {
            prompt.push_str(&format!(
                "\nSource around the finding (`>` marks the reported lines, numbers are 1-indexed):\n{}",
                context
            ));
        }

        prompt.push_str(
            "\nGenerate one unified diff patch for this file that fixes the finding.",
        );
        prompt
    }

    fn batch_prompt(&self, findings: &[Finding]) -> String {
        let reader = ContextReader::new(self.context_lines);
        let file = &findings[0].location.file;

        let mut prompt = format!(
            "Fix all of these static analysis findings in `{}` with a single unified diff.\n\n",
            file.display()
        );

        for (i, finding) in findings.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. {} ({}) at line {}: {}\n",
                i + 1,
                finding.rule_id,
                finding.tool,
                finding.location.line,
                finding.message,
            ));
            let context = reader.window(&self.repo_root, finding);
            if !context.is_empty() {
                prompt.push_str(&format!("{}\n", context));
            }
        }

        prompt.push_str(
            "Generate one unified diff covering all the findings above. \
             Order hunks by line number and make sure later hunk headers \
             account for lines added or removed by earlier hunks.",
        );
        prompt
    }

    fn repair_prompt(&self, finding: &Finding, failed_patch: Option<&str>) -> String {
        let mut prompt = format!(
            "The following patch for `{}` fixes the right thing but its diff \
             formatting is broken, so it cannot be applied.\n\n",
            finding.location.file.display()
        );

        if let Some(patch) = failed_patch {
            prompt.push_str(&format!("Broken patch:\n```\n{}\n```\n\n", patch));
        }

        prompt.push_str(
            "Re-emit the same change as a correctly formatted unified diff. \
             Do not re-derive or alter the fix itself: correct the headers, \
             hunk counts, and line prefixes only.",
        );
        prompt
    }
}

fn feedback_section(feedback: Feedback<'_>) -> String {
    let mut section = format!(
        "IMPORTANT: Attempt {} failed with:\n{}\n",
        feedback.attempt, feedback.error
    );

    let advice = match feedback.kind {
        Some(ErrorKind::MalformedDiff) => {
            "Address the failure above: re-emit the diff with correct '---'/'+++' headers, \
             accurate '@@' hunk counts, and a '+', '-', or space prefix on every content line."
        }
        Some(ErrorKind::ContextMismatch) => {
            "Address the failure above: the context lines in your diff did not match the file. \
             Re-derive which lines actually change from the source shown below and copy \
             context lines exactly as they appear."
        }
        Some(ErrorKind::PathMismatch) => {
            "Address the failure above: use the exact relative file path given, with no \
             leading '/' and no directories that are not shown."
        }
        _ => "Address the failure above before anything else.",
    };
    section.push_str(advice);
    section
}
