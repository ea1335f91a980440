//! Unified diff structure
//!
//! Structural parsing and repair of unified diffs coming back from the model.
//! Nothing here touches the working tree; applying is the validator's job.
//!
//! The header repair pass exists because the single most common model failure
//! is an `@@` header whose line numbers or counts disagree with the hunk body
//! ("corrupt patch at line N"). Recounting the body and re-anchoring against
//! the real file rescues those patches without another LLM round-trip.

use std::path::{Path, PathBuf};

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// Count of (old-side, new-side) lines derived from the body, ignoring
    /// whatever the header claims.
    pub fn body_counts(&self) -> (usize, usize) {
        let old = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Remove(_)))
            .count();
        let new = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Context(_) | DiffLine::Add(_)))
            .count();
        (old.max(1), new.max(1))
    }

    /// First line of the old side, used to re-anchor a wrong header.
    fn anchor_line(&self) -> Option<&str> {
        self.lines.iter().find_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
            DiffLine::Add(_) => None,
        })
    }

    /// True when the hunk's removals and additions are the same lines, so
    /// applying it would not change the file.
    pub fn is_noop(&self) -> bool {
        let removed: Vec<&String> = self
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Remove(s) => Some(s),
                _ => None,
            })
            .collect();
        let added: Vec<&String> = self
            .lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Add(s) => Some(s),
                _ => None,
            })
            .collect();
        removed == added
    }

    fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

/// A parsed unified diff for one file
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedDiff {
    pub old_path: String,
    pub new_path: String,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    /// The file the diff targets, taken from the `+++ b/` header.
    pub fn target_path(&self) -> PathBuf {
        PathBuf::from(&self.new_path)
    }

    /// True when every hunk is a no-op, so the whole patch changes nothing.
    pub fn is_noop(&self) -> bool {
        self.hunks.iter().all(DiffHunk::is_noop)
    }
}

/// Structural problems with a diff, phrased for model feedback.
pub fn format_errors(diff: &str) -> Vec<String> {
    let mut errors = Vec::new();

    if diff.trim().is_empty() {
        errors.push("Empty diff content".to_string());
        return errors;
    }

    let lines: Vec<&str> = diff.lines().collect();
    if !lines.iter().any(|l| l.starts_with("--- ")) {
        errors.push("Missing '--- a/...' file header".to_string());
    }
    if !lines.iter().any(|l| l.starts_with("+++ ")) {
        errors.push("Missing '+++ b/...' file header".to_string());
    }
    if !lines.iter().any(|l| l.starts_with("@@")) {
        errors.push("Missing '@@ ... @@' hunk header".to_string());
    }

    let has_adds = lines
        .iter()
        .any(|l| l.starts_with('+') && !l.starts_with("+++"));
    let has_removes = lines
        .iter()
        .any(|l| l.starts_with('-') && !l.starts_with("---"));
    if !has_adds && !has_removes {
        errors.push("No actual changes found (no +/- lines)".to_string());
    }

    errors
}

/// Quick check that text is at least shaped like a unified diff.
pub fn looks_like_diff(text: &str) -> bool {
    format_errors(text).is_empty()
}

/// Parse a unified diff string into structured data. Multi-file responses are
/// handled by [`split_file_diffs`] before this is called.
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.lines().collect();

    let mut old_path = String::new();
    let mut new_path = String::new();
    let mut body_start = 0;

    for (i, line) in lines.iter().enumerate() {
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = strip_path_decoration(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = strip_path_decoration(rest);
            body_start = i + 1;
            break;
        }
    }

    if old_path.is_empty() || new_path.is_empty() {
        return Err("Could not find file paths in diff".to_string());
    }

    let mut hunks = Vec::new();
    let mut i = body_start;
    while i < lines.len() {
        if lines[i].starts_with("@@") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("No hunks found in diff".to_string());
    }

    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

/// Drop the `a/` / `b/` prefix and any timestamp suffix from a header path.
fn strip_path_decoration(raw: &str) -> String {
    let mut path = raw
        .trim_start_matches("a/")
        .trim_start_matches("b/")
        .to_string();
    if let Some(tab) = path.find('\t') {
        path.truncate(tab);
    }
    path.trim().to_string()
}

/// Parse `@@ -old_start,old_count +new_start,new_count @@`; counts default
/// to 1 when omitted.
fn parse_hunk_header(header: &str) -> Result<(usize, usize, usize, usize), String> {
    let re = regex::Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
        .map_err(|e| e.to_string())?;
    let caps = re
        .captures(header)
        .ok_or_else(|| format!("Invalid hunk header: {}", header))?;

    let num = |i: usize, default: usize| -> Result<usize, String> {
        match caps.get(i) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| format!("Invalid hunk header: {}", header)),
            None => Ok(default),
        }
    };

    Ok((num(1, 0)?, num(2, 1)?, num(3, 0)?, num(4, 1)?))
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let (old_start, old_count, new_start, new_count) = parse_hunk_header(lines[*idx])?;

    *idx += 1;
    let mut body = Vec::new();

    while *idx < lines.len() {
        let line = lines[*idx];
        if line.starts_with("@@") || line.starts_with("diff ") || line.starts_with("--- ") {
            break;
        }

        if let Some(rest) = line.strip_prefix('+') {
            body.push(DiffLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            body.push(DiffLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            body.push(DiffLine::Context(rest.to_string()));
        } else if line.is_empty() {
            body.push(DiffLine::Context(String::new()));
        }
        // Anything else ("\ No newline at end of file", index lines) is skipped.

        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: body,
    })
}

/// Split a response body containing several `diff --git` (or bare `---`)
/// sections into one string per file.
pub fn split_file_diffs(text: &str) -> Vec<String> {
    let mut sections: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let starts_new_file = line.starts_with("diff --git")
            || (line.starts_with("--- ") && section_has_hunk(&current));
        if starts_new_file && !current.is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push(line);
    }
    if !current.is_empty() {
        sections.push(current);
    }

    sections
        .into_iter()
        .map(|s| s.join("\n"))
        .filter(|s| s.contains("@@"))
        .collect()
}

fn section_has_hunk(section: &[&str]) -> bool {
    section.iter().any(|l| l.starts_with("@@"))
}

/// Rewrite `@@` headers whose positions or counts disagree with the hunk body
/// or with the actual file content. Returns the (possibly rewritten) diff and
/// whether anything changed. Content lines are never touched.
pub fn repair_hunk_headers(diff: &str, file_content: &str) -> (String, bool) {
    let parsed = match parse_unified_diff(diff) {
        Ok(parsed) => parsed,
        Err(_) => return (diff.to_string(), false),
    };

    let mut repaired = false;
    let mut out_lines: Vec<String> = Vec::new();
    let mut hunk_iter = parsed.hunks.iter();

    for line in diff.lines() {
        if line.starts_with("@@") {
            if let Some(hunk) = hunk_iter.next() {
                let fixed = repair_header(hunk, file_content);
                if fixed != *line {
                    repaired = true;
                }
                out_lines.push(fixed);
                continue;
            }
        }
        out_lines.push(line.to_string());
    }

    let mut out = out_lines.join("\n");
    if diff.ends_with('\n') {
        out.push('\n');
    }
    (out, repaired)
}

fn repair_header(hunk: &DiffHunk, file_content: &str) -> String {
    let (old_count, new_count) = hunk.body_counts();

    let old_start = hunk
        .anchor_line()
        .and_then(|anchor| find_line(file_content, anchor))
        .unwrap_or(hunk.old_start);

    // Single-hunk patches keep both sides anchored at the same line; the
    // offset between sides only matters across multiple hunks, where the
    // original header offsets are preserved.
    let shift = hunk.new_start as i64 - hunk.old_start as i64;
    let new_start = (old_start as i64 + shift).max(1) as usize;

    DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: hunk.lines.clone(),
    }
    .header()
}

/// 1-indexed line number where `needle` appears in the file, exact match
/// first, then trimmed.
fn find_line(content: &str, needle: &str) -> Option<usize> {
    for (i, line) in content.lines().enumerate() {
        if line == needle {
            return Some(i + 1);
        }
    }
    let trimmed = needle.trim();
    if trimmed.is_empty() {
        return None;
    }
    for (i, line) in content.lines().enumerate() {
        if line.trim() == trimmed {
            return Some(i + 1);
        }
    }
    None
}
