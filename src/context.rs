//! Source context around findings
//!
//! Reads a bounded, line-numbered window of the file surrounding a finding so
//! prompts can ground the model in the code as it exists right now. A missing
//! or unreadable file degrades to an empty window; the attempt proceeds and
//! the validator reports the real problem.

use crate::finding::Finding;
use std::fs;
use std::path::Path;

/// Default lines of context before/after a finding.
pub const DEFAULT_CONTEXT_LINES: usize = 5;

/// Wider window used by the contextual strategy after a context mismatch.
pub const WIDE_CONTEXT_LINES: usize = 12;

pub struct ContextReader {
    context_lines: usize,
}

impl ContextReader {
    pub fn new(context_lines: usize) -> Self {
        Self { context_lines }
    }

    /// Read the window around a finding, formatted with 1-indexed line numbers
    /// and a `>` marker on the finding's own lines:
    ///
    /// ```text
    ///    10: def handler():
    /// >  11:     try:
    /// >  12:     except:
    ///    13:         pass
    /// ```
    pub fn window(&self, repo_root: &Path, finding: &Finding) -> String {
        let path = finding.path_in(repo_root);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                eprintln!(
                    "  Warning: could not read {} for context: {}",
                    path.display(),
                    err
                );
                return String::new();
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return String::new();
        }

        let first = finding.location.line;
        let last = finding.location.end_line.unwrap_or(first).max(first);

        let start = first.saturating_sub(self.context_lines).max(1);
        let end = (last + self.context_lines).min(lines.len());
        if start > lines.len() {
            // Finding points past the end of the file; show the tail instead.
            let tail_start = lines.len().saturating_sub(self.context_lines).max(1);
            return render(&lines, tail_start, lines.len(), first, last);
        }

        render(&lines, start, end, first, last)
    }
}

fn render(lines: &[&str], start: usize, end: usize, first: usize, last: usize) -> String {
    let mut out = String::new();
    for num in start..=end {
        let marker = if num >= first && num <= last { ">" } else { " " };
        out.push_str(&format!("{} {:4}: {}\n", marker, num, lines[num - 1]));
    }
    out
}
