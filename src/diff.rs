//! Unified diff model: computing, rendering and parsing
//!
//! A patch body is a sequence of file sections. Each section names exactly one
//! logical path and looks like a classic unified diff:
//!
//! ```text
//! mode 0755 bin/setup          <- optional, permission bits after applying
//! --- bin/setup                <- "/dev/null" when the file did not exist
//! +++ bin/setup                <- "/dev/null" when the file is deleted
//! @@ -1,3 +1,4 @@
//!  unchanged
//! -removed
//! +added
//! \ No newline at end of file
//! ```
//!
//! Two kinds of section carry no hunks: a *header-only* section (`---`/`+++`
//! with one side `/dev/null`) creates or deletes an empty file, and a
//! *mode-only* section (just the `mode` line) changes permissions of a file
//! whose content did not change.
//!
//! Line texts keep their terminators, so `"a\n"` and `"a"` are different lines
//! and the "No newline" marker round-trips exactly.

use crate::error::{PatchError, Result};
use crate::utils;
use similar::{ChangeTag, TextDiff};
use std::collections::HashSet;

/// Label used for the absent side of a creation or deletion
pub const DEV_NULL: &str = "/dev/null";

/// Marker emitted after a line that lacks a trailing newline
pub const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// One line of a hunk, text including its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineChange {
    /// Line present in both versions
    Context(String),
    /// Line only in the old version
    Deleted(String),
    /// Line only in the new version
    Added(String),
}

impl LineChange {
    /// Text of the line including its terminator
    pub fn text(&self) -> &str {
        match self {
            LineChange::Context(t) | LineChange::Deleted(t) | LineChange::Added(t) => t,
        }
    }

    fn text_mut(&mut self) -> &mut String {
        match self {
            LineChange::Context(t) | LineChange::Deleted(t) | LineChange::Added(t) => t,
        }
    }

    fn prefix(&self) -> char {
        match self {
            LineChange::Context(_) => ' ',
            LineChange::Deleted(_) => '-',
            LineChange::Added(_) => '+',
        }
    }
}

/// A contiguous group of changes with surrounding context
///
/// `from_line`/`to_line` are the numbers written in the `@@` header: 1-based
/// starts, or the line *after which* the hunk applies when the count is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    /// Start line in the old file
    pub from_line: usize,
    /// Number of old lines covered
    pub from_count: usize,
    /// Start line in the new file
    pub to_line: usize,
    /// Number of new lines covered
    pub to_count: usize,
    /// Lines of the hunk in order
    pub changes: Vec<LineChange>,
}

impl DiffHunk {
    /// Lines the hunk expects to find (context and deletions)
    pub fn old_lines(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| !matches!(c, LineChange::Added(_)))
            .map(|c| c.text())
            .collect()
    }

    /// Lines the hunk leaves behind (context and additions)
    pub fn new_lines(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| !matches!(c, LineChange::Deleted(_)))
            .map(|c| c.text())
            .collect()
    }

    /// Number of context lines before the first change
    pub fn leading_context(&self) -> usize {
        self.changes
            .iter()
            .take_while(|c| matches!(c, LineChange::Context(_)))
            .count()
    }

    /// Number of context lines after the last change
    pub fn trailing_context(&self) -> usize {
        self.changes
            .iter()
            .rev()
            .take_while(|c| matches!(c, LineChange::Context(_)))
            .count()
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            self.from_line, self.from_count, self.to_line, self.to_count
        ));
        for change in &self.changes {
            out.push(change.prefix());
            out.push_str(change.text());
            if !change.text().ends_with('\n') {
                out.push('\n');
                out.push_str(NO_NEWLINE_MARKER);
                out.push('\n');
            }
        }
    }
}

/// Everything a patch says about one logical path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Logical path relative to the tree root
    pub path: String,
    /// The file does not exist before the patch
    pub old_absent: bool,
    /// The file does not exist after the patch
    pub new_absent: bool,
    /// Permission bits to set after applying, if they change
    pub mode: Option<u32>,
    /// Content hunks
    pub hunks: Vec<DiffHunk>,
}

impl FilePatch {
    /// Section that only changes permission bits
    pub fn mode_only(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            old_absent: false,
            new_absent: false,
            mode: Some(mode),
            hunks: Vec::new(),
        }
    }

    /// Whether the file is created by this section
    pub fn is_creation(&self) -> bool {
        self.old_absent && !self.new_absent
    }

    /// Whether the file is deleted by this section
    pub fn is_deletion(&self) -> bool {
        self.new_absent && !self.old_absent
    }

    /// Whether the section has `---`/`+++` headers
    pub fn has_content_section(&self) -> bool {
        !self.hunks.is_empty() || self.old_absent != self.new_absent
    }

    /// Render the section as unified diff text
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(mode) = self.mode {
            out.push_str(&format!("mode {:04o} {}\n", mode, self.path));
        }
        if self.has_content_section() {
            let old = if self.old_absent { DEV_NULL } else { self.path.as_str() };
            let new = if self.new_absent { DEV_NULL } else { self.path.as_str() };
            out.push_str(&format!("--- {}\n+++ {}\n", old, new));
            for hunk in &self.hunks {
                hunk.render(&mut out);
            }
        }
        out
    }
}

/// An ordered collection of file sections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    /// File sections in body order
    pub files: Vec<FilePatch>,
}

impl PatchSet {
    /// Whether the set has no sections
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Logical paths touched, in body order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }

    /// Render all sections
    pub fn render(&self) -> String {
        self.files.iter().map(FilePatch::render).collect()
    }

    /// Parse a unified diff body
    ///
    /// Lines outside of sections that are not recognized (for example
    /// `diff -u ...` command echoes) are skipped. Every path must be a valid
    /// logical path and may appear in only one section.
    pub fn parse(body: &str) -> Result<Self> {
        let lines: Vec<&str> = body.split_inclusive('\n').collect();
        let mut files: Vec<FilePatch> = Vec::new();
        let mut pending_mode: Option<(u32, String)> = None;
        let mut i = 0;

        while i < lines.len() {
            let line = strip_eol(lines[i]);

            if let Some(rest) = line.strip_prefix("mode ") {
                if let Some((mode, path)) = pending_mode.take() {
                    files.push(FilePatch::mode_only(path, mode));
                }
                pending_mode = Some(parse_mode_line(rest, i + 1)?);
                i += 1;
            } else if let Some(old_label) = line.strip_prefix("--- ") {
                let new_line = lines
                    .get(i + 1)
                    .map(|l| strip_eol(l))
                    .ok_or_else(|| PatchError::malformed_diff(i + 2, "missing +++ header"))?;
                let new_label = new_line
                    .strip_prefix("+++ ")
                    .ok_or_else(|| PatchError::malformed_diff(i + 2, "expected +++ header"))?;

                let old_label = strip_timestamp(old_label);
                let new_label = strip_timestamp(new_label);
                let old_absent = old_label == DEV_NULL;
                let new_absent = new_label == DEV_NULL;
                let path = match (old_absent, new_absent) {
                    (true, true) => {
                        return Err(PatchError::malformed_diff(i + 1, "both sides are /dev/null"))
                    }
                    (true, false) => new_label,
                    (false, true) => old_label,
                    (false, false) if old_label == new_label => old_label,
                    (false, false) => {
                        return Err(PatchError::malformed_diff(
                            i + 1,
                            format!("renames are not supported ({} -> {})", old_label, new_label),
                        ))
                    }
                };
                utils::validate_logical_path(path)?;

                i += 2;
                let mut hunks = Vec::new();
                while i < lines.len() && lines[i].starts_with("@@ ") {
                    let (hunk, next) = parse_hunk(&lines, i)?;
                    hunks.push(hunk);
                    i = next;
                }

                let mode = match pending_mode.take() {
                    Some((mode, mode_path)) if mode_path == path => Some(mode),
                    Some((mode, mode_path)) => {
                        files.push(FilePatch::mode_only(mode_path, mode));
                        None
                    }
                    None => None,
                };

                files.push(FilePatch {
                    path: path.to_string(),
                    old_absent,
                    new_absent,
                    mode,
                    hunks,
                });
            } else if line.starts_with("@@ ") {
                return Err(PatchError::malformed_diff(i + 1, "hunk outside of a file section"));
            } else {
                i += 1;
            }
        }

        if let Some((mode, path)) = pending_mode.take() {
            files.push(FilePatch::mode_only(path, mode));
        }

        let mut seen = HashSet::new();
        for file in &files {
            if !seen.insert(file.path.as_str()) {
                return Err(PatchError::malformed_diff(
                    0,
                    format!("{} appears in more than one section", file.path),
                ));
            }
        }

        Ok(Self { files })
    }
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

/// Drop the tab-separated timestamp `diff` appends when no label is given
fn strip_timestamp(label: &str) -> &str {
    label.split('\t').next().unwrap_or(label).trim_end()
}

fn parse_mode_line(rest: &str, line_no: usize) -> Result<(u32, String)> {
    let (mode, path) = rest
        .split_once(' ')
        .ok_or_else(|| PatchError::malformed_diff(line_no, "mode line needs a path"))?;
    let mode = u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| PatchError::malformed_diff(line_no, format!("bad mode {}", mode)))?;
    utils::validate_logical_path(path)?;
    Ok((mode, path.to_string()))
}

fn parse_range(text: &str, line_no: usize) -> Result<(usize, usize)> {
    let parse = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| PatchError::malformed_diff(line_no, format!("bad range {}", text)))
    };
    match text.split_once(',') {
        Some((start, count)) => Ok((parse(start)?, parse(count)?)),
        None => Ok((parse(text)?, 1)),
    }
}

fn parse_hunk(lines: &[&str], start: usize) -> Result<(DiffHunk, usize)> {
    let header = strip_eol(lines[start]);
    let line_no = start + 1;
    let inner = header
        .strip_prefix("@@ ")
        .and_then(|h| h.split(" @@").next())
        .ok_or_else(|| PatchError::malformed_diff(line_no, "bad hunk header"))?;
    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| PatchError::malformed_diff(line_no, "missing old range"))?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| PatchError::malformed_diff(line_no, "missing new range"))?;
    let (from_line, from_count) = parse_range(old, line_no)?;
    let (to_line, to_count) = parse_range(new, line_no)?;

    let mut changes: Vec<LineChange> = Vec::new();
    let mut old_left = from_count;
    let mut new_left = to_count;
    let mut i = start + 1;

    while old_left > 0 || new_left > 0 {
        let raw = lines
            .get(i)
            .ok_or_else(|| PatchError::malformed_diff(i + 1, "hunk ends early"))?;
        let (kind, text) = match raw.chars().next() {
            Some(' ') => (' ', &raw[1..]),
            Some('-') => ('-', &raw[1..]),
            Some('+') => ('+', &raw[1..]),
            Some('\\') => {
                mark_no_newline(&mut changes, i + 1)?;
                i += 1;
                continue;
            }
            // Some tools strip the space from empty context lines
            Some('\n') | Some('\r') => (' ', *raw),
            _ => return Err(PatchError::malformed_diff(i + 1, "unexpected line in hunk")),
        };

        match kind {
            ' ' if old_left > 0 && new_left > 0 => {
                old_left -= 1;
                new_left -= 1;
                changes.push(LineChange::Context(text.to_string()));
            }
            '-' if old_left > 0 => {
                old_left -= 1;
                changes.push(LineChange::Deleted(text.to_string()));
            }
            '+' if new_left > 0 => {
                new_left -= 1;
                changes.push(LineChange::Added(text.to_string()));
            }
            _ => return Err(PatchError::malformed_diff(i + 1, "hunk line count mismatch")),
        }
        i += 1;
    }

    if lines.get(i).map(|l| l.starts_with('\\')).unwrap_or(false) {
        mark_no_newline(&mut changes, i + 1)?;
        i += 1;
    }

    Ok((
        DiffHunk {
            from_line,
            from_count,
            to_line,
            to_count,
            changes,
        },
        i,
    ))
}

fn mark_no_newline(changes: &mut [LineChange], line_no: usize) -> Result<()> {
    let last = changes
        .last_mut()
        .ok_or_else(|| PatchError::malformed_diff(line_no, "newline marker without a line"))?;
    let text = last.text_mut();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(())
}

/// Check if content appears to be binary
pub fn is_binary_content(content: &[u8]) -> bool {
    let check_len = content.len().min(8192);
    content[..check_len].contains(&0)
}

/// Compute hunks between two texts with `context_lines` of context
///
/// Lines end at `\n` only, the same split the parser and the applier use, so
/// a stray `\r` stays inside its line and the header counts match the body.
pub fn compute_hunks(old: &str, new: &str, context_lines: usize) -> Vec<DiffHunk> {
    let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();
    let diff = TextDiff::configure().diff_slices(&old_lines, &new_lines);
    let mut hunks = Vec::new();

    for group in diff.grouped_ops(context_lines) {
        let first = match group.first() {
            Some(first) => first,
            None => continue,
        };
        let old_start = first.old_range().start;
        let new_start = first.new_range().start;

        let mut changes = Vec::new();
        for op in &group {
            for change in diff.iter_changes(op) {
                let text = change.value().to_string();
                changes.push(match change.tag() {
                    ChangeTag::Equal => LineChange::Context(text),
                    ChangeTag::Delete => LineChange::Deleted(text),
                    ChangeTag::Insert => LineChange::Added(text),
                });
            }
        }

        let old_len = changes.iter().filter(|c| !matches!(c, LineChange::Added(_))).count();
        let new_len = changes.iter().filter(|c| !matches!(c, LineChange::Deleted(_))).count();
        hunks.push(DiffHunk {
            from_line: if old_len == 0 { old_start } else { old_start + 1 },
            from_count: old_len,
            to_line: if new_len == 0 { new_start } else { new_start + 1 },
            to_count: new_len,
            changes,
        });
    }

    hunks
}

/// Decode file content for diffing, rejecting binary data
pub fn decode_text<'a>(path: &str, content: &'a [u8]) -> Result<&'a str> {
    if is_binary_content(content) {
        return Err(PatchError::BinaryContent(path.to_string()));
    }
    std::str::from_utf8(content).map_err(|_| PatchError::BinaryContent(path.to_string()))
}

/// Build the content section for one file
///
/// `None` on either side means the file is absent; an absent file diffs like
/// an empty one, but the section records the absence so that empty files are
/// created and deleted faithfully. Returns `None` when nothing differs.
pub fn diff_contents(
    path: &str,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
    context_lines: usize,
) -> Result<Option<FilePatch>> {
    let old_text = old.map(|c| decode_text(path, c)).transpose()?.unwrap_or("");
    let new_text = new.map(|c| decode_text(path, c)).transpose()?.unwrap_or("");

    let hunks = compute_hunks(old_text, new_text, context_lines);
    if hunks.is_empty() && old.is_some() == new.is_some() {
        return Ok(None);
    }

    Ok(Some(FilePatch {
        path: path.to_string(),
        old_absent: old.is_none(),
        new_absent: new.is_none(),
        mode: None,
        hunks,
    }))
}
