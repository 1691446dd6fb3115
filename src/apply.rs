//! In-process application of unified diffs
//!
//! Hunks are placed the way classic `patch` places them: at the line number in
//! the header adjusted by the drift of earlier hunks, else at the nearest
//! position where the expected lines match, else (with fuzz) after ignoring up
//! to `max_fuzz` context lines at each end of the hunk.
//!
//! In [`ApplyMode::Batch`] every file is planned in memory before anything is
//! written, so a single unplaceable hunk leaves the tree untouched. In
//! [`ApplyMode::Merge`] an unplaceable hunk is written as a conflict block:
//!
//! ```text
//! <<<<<<< local
//! what the file has at that position
//! =======
//! what the hunk wanted there
//! >>>>>>> upstream
//! ```

use crate::diff::{DiffHunk, FilePatch, PatchSet};
use crate::error::{PatchError, Result};
use crate::types::{ApplyMode, ApplyOutcome};
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Opens a conflict block
pub const CONFLICT_START: &str = "<<<<<<< local";
/// Separates the local side from the upstream side
pub const CONFLICT_SEPARATOR: &str = "=======";
/// Closes a conflict block
pub const CONFLICT_END: &str = ">>>>>>> upstream";

/// Whether text contains a line that opens a conflict block
pub fn has_conflict_markers(text: &str) -> bool {
    text.lines().any(|line| line.starts_with("<<<<<<<"))
}

#[derive(Debug)]
enum FileAction {
    Write(String),
    Delete,
    Keep,
}

#[derive(Debug)]
struct FilePlan {
    logical: String,
    path: PathBuf,
    action: FileAction,
    existed: bool,
    previous_mode: Option<u32>,
    mode: Option<u32>,
    conflicted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    pos: usize,
    front: usize,
    back: usize,
}

/// Apply every section of `set` under `target`
pub fn apply_patch_set(
    target: &Path,
    set: &PatchSet,
    mode: ApplyMode,
    max_fuzz: usize,
) -> Result<ApplyOutcome> {
    let mut plans = Vec::with_capacity(set.files.len());
    for file in &set.files {
        match plan_file(target, file, mode, max_fuzz) {
            Ok(Some(plan)) => plans.push(plan),
            Ok(None) => {}
            Err(e) if mode == ApplyMode::Merge && !matches!(e, PatchError::Io(_)) => {
                warn!("Skipping {}: {}", file.path, e);
            }
            Err(e) => return Err(e),
        }
    }

    let mut outcome = ApplyOutcome::default();
    for plan in plans {
        commit_plan(target, plan, &mut outcome)?;
    }
    debug!(
        "Applied {} sections: {} patched, {} created, {} deleted, {} conflicts",
        set.files.len(),
        outcome.files_patched.len(),
        outcome.files_created.len(),
        outcome.files_deleted.len(),
        outcome.conflicts.len()
    );
    Ok(outcome)
}

fn read_current(logical: &str, path: &Path) -> Result<Option<String>> {
    if path.is_dir() {
        return Err(PatchError::InvalidPath(format!("{} is a directory", logical)));
    }
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    crate::diff::decode_text(logical, &bytes).map(|s| Some(s.to_string()))
}

fn plan_file(
    target: &Path,
    file: &FilePatch,
    mode: ApplyMode,
    max_fuzz: usize,
) -> Result<Option<FilePlan>> {
    let path = utils::resolve_logical(target, &file.path)?;
    let current = read_current(&file.path, &path)?;
    let existed = current.is_some();
    let previous_mode = if existed {
        Some(utils::get_permissions(&path)?)
    } else {
        None
    };

    let mut plan = FilePlan {
        logical: file.path.clone(),
        path,
        action: FileAction::Keep,
        existed,
        previous_mode,
        mode: file.mode,
        conflicted: false,
    };

    if !file.has_content_section() {
        if !existed {
            return Err(PatchError::TargetMissing(file.path.clone()));
        }
        return Ok(Some(plan));
    }

    if file.old_absent {
        let wanted: String = file.hunks.iter().flat_map(|h| h.new_lines()).collect();
        match current {
            None => plan.action = FileAction::Write(wanted),
            Some(cur) if cur == wanted => {
                debug!("{} already has the content being created", file.path);
            }
            Some(cur) => match mode {
                ApplyMode::Batch => {
                    return Err(PatchError::HunkRejected {
                        path: file.path.clone(),
                        hunk: 1,
                    })
                }
                ApplyMode::Merge => {
                    let local: Vec<&str> = cur.split_inclusive('\n').collect();
                    let upstream: Vec<&str> = wanted.split_inclusive('\n').collect();
                    let mut out = String::new();
                    push_conflict(&mut out, &local, &upstream);
                    plan.action = FileAction::Write(out);
                    plan.conflicted = true;
                }
            },
        }
        return Ok(Some(plan));
    }

    let cur = match current {
        Some(cur) => cur,
        None if file.new_absent && file.hunks.is_empty() => return Ok(None),
        None => return Err(PatchError::TargetMissing(file.path.clone())),
    };

    let (content, conflicts) = apply_hunks(&file.path, &cur, &file.hunks, mode, max_fuzz)?;
    plan.conflicted = conflicts > 0;

    if file.new_absent {
        if content.is_empty() && !plan.conflicted {
            plan.action = FileAction::Delete;
        } else {
            warn!("Not deleting {}: content remains after removing the old lines", file.path);
            plan.action = FileAction::Write(content);
        }
    } else if content != cur {
        plan.action = FileAction::Write(content);
    }

    Ok(Some(plan))
}

/// Apply hunks to `content`, returning the new text and the number of conflicts
fn apply_hunks(
    logical: &str,
    content: &str,
    hunks: &[DiffHunk],
    mode: ApplyMode,
    max_fuzz: usize,
) -> Result<(String, usize)> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;
    let mut offset: isize = 0;
    let mut conflicts = 0;

    for (index, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new = hunk.new_lines();
        let base = if hunk.from_count == 0 {
            hunk.from_line
        } else {
            hunk.from_line.saturating_sub(1)
        };
        let expected = (base as isize + offset).max(0) as usize;

        match locate(&lines, cursor, expected, hunk, &old, max_fuzz) {
            Some(placement) => {
                out.extend(lines[cursor..placement.pos].iter().copied());
                out.extend(new[placement.front..new.len() - placement.back].iter().copied());
                cursor = placement.pos + old.len() - placement.front - placement.back;
                offset = placement.pos as isize - placement.front as isize - base as isize;
                trace!(
                    "Hunk #{} of {} placed at line {} (offset {}, fuzz {}/{})",
                    index + 1,
                    logical,
                    placement.pos + 1,
                    offset,
                    placement.front,
                    placement.back
                );
            }
            None if mode == ApplyMode::Batch => {
                return Err(PatchError::HunkRejected {
                    path: logical.to_string(),
                    hunk: index + 1,
                });
            }
            None => {
                let pos = expected.clamp(cursor, lines.len());
                let end = (pos + old.len()).min(lines.len());
                out.extend(lines[cursor..pos].iter().copied());
                push_conflict(&mut out, &lines[pos..end], &new);
                cursor = end;
                conflicts += 1;
                warn!("Hunk #{} of {} conflicts at line {}", index + 1, logical, pos + 1);
            }
        }
    }

    out.extend(lines[cursor..].iter().copied());
    Ok((out, conflicts))
}

fn locate(
    lines: &[&str],
    cursor: usize,
    expected: usize,
    hunk: &DiffHunk,
    old: &[&str],
    max_fuzz: usize,
) -> Option<Placement> {
    let lead = hunk.leading_context();
    let trail = hunk.trailing_context();
    let mut tried: Option<(usize, usize)> = None;

    for fuzz in 0..=max_fuzz {
        let front = fuzz.min(lead);
        let back = fuzz.min(trail).min(old.len() - front);
        if tried == Some((front, back)) {
            continue;
        }
        // Fuzz may trim context but must leave something to match
        if !old.is_empty() && front + back >= old.len() {
            break;
        }
        tried = Some((front, back));

        let needle = &old[front..old.len() - back];
        if let Some(pos) = search(lines, cursor, expected + front, needle) {
            return Some(Placement { pos, front, back });
        }
    }
    None
}

/// Nearest position at or after `cursor` where `needle` matches, closest to `want`
fn search(lines: &[&str], cursor: usize, want: usize, needle: &[&str]) -> Option<usize> {
    if lines.len() < needle.len() {
        return None;
    }
    let max_pos = lines.len() - needle.len();
    if cursor > max_pos {
        return None;
    }
    let want = want.clamp(cursor, max_pos);
    let matches_at = |pos: usize| lines[pos..pos + needle.len()] == *needle;

    let mut distance = 0;
    loop {
        let mut in_range = false;
        if want + distance <= max_pos {
            in_range = true;
            if matches_at(want + distance) {
                return Some(want + distance);
            }
        }
        if distance > 0 && want >= cursor + distance {
            in_range = true;
            if matches_at(want - distance) {
                return Some(want - distance);
            }
        }
        if !in_range {
            return None;
        }
        distance += 1;
    }
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    if !line.ends_with('\n') {
        out.push('\n');
    }
}

fn push_conflict(out: &mut String, local: &[&str], upstream: &[&str]) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    push_line(out, CONFLICT_START);
    for line in local {
        push_line(out, line);
    }
    push_line(out, CONFLICT_SEPARATOR);
    for line in upstream {
        push_line(out, line);
    }
    push_line(out, CONFLICT_END);
}

/// Finish a file whose text an external tool has already rewritten
///
/// A deletion that left the file empty removes it, mode bits are applied and
/// the result lands in `outcome` the same way a builtin apply reports it.
pub(crate) fn settle_rewritten(
    target: &Path,
    file: &FilePatch,
    existed: bool,
    mode: ApplyMode,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    let path = utils::resolve_logical(target, &file.path)?;
    let current = match read_current(&file.path, &path)? {
        Some(current) => current,
        None => {
            if existed {
                utils::prune_empty_parents(target, &path)?;
                outcome.files_deleted.push(file.path.clone());
            }
            return Ok(());
        }
    };

    let conflicted = mode == ApplyMode::Merge && has_conflict_markers(&current);
    let plan = FilePlan {
        logical: file.path.clone(),
        previous_mode: Some(utils::get_permissions(&path)?),
        path,
        action: if file.new_absent && current.is_empty() {
            FileAction::Delete
        } else {
            FileAction::Write(current)
        },
        existed,
        mode: file.mode,
        conflicted,
    };
    commit_plan(target, plan, outcome)
}

fn commit_plan(target: &Path, plan: FilePlan, outcome: &mut ApplyOutcome) -> Result<()> {
    let mut changed = false;

    match plan.action {
        FileAction::Write(content) => {
            if let Some(parent) = plan.path.parent() {
                fs::create_dir_all(parent)?;
            }
            utils::atomic_write(&plan.path, content.as_bytes())?;
            // The rename replaced the inode, so restore the old bits first
            if let (Some(previous), None) = (plan.previous_mode, plan.mode) {
                utils::set_permissions(&plan.path, previous)?;
            }
            changed = true;
        }
        FileAction::Delete => {
            fs::remove_file(&plan.path)?;
            utils::prune_empty_parents(target, &plan.path)?;
            outcome.files_deleted.push(plan.logical);
            return Ok(());
        }
        FileAction::Keep => {}
    }

    if let Some(mode) = plan.mode {
        if plan.path.is_file() {
            if plan.previous_mode != Some(mode) {
                changed = true;
            }
            utils::set_permissions(&plan.path, mode)?;
        }
    }

    if !plan.existed && plan.path.is_file() {
        outcome.files_created.push(plan.logical.clone());
    } else if changed {
        outcome.files_patched.push(plan.logical.clone());
    }
    if plan.conflicted {
        outcome.conflicts.push(plan.logical);
    }
    Ok(())
}
