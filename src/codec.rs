//! Patch Codec: producing and applying unified diffs
//!
//! The engine never compares or rewrites file contents itself; it goes through
//! a [`PatchCodec`]. Two implementations ship with the crate:
//!
//! - [`BuiltinCodec`] diffs with the `similar` crate and applies hunks in
//!   process (see [`crate::apply`]).
//! - [`ExternalCodec`] runs `diff -u` and `patch -p0` and interprets their exit
//!   statuses: `0` and `1` are results, anything else is serious trouble.
//!
//! Both honor the same contract. Section headers always carry the logical
//! path, `/dev/null` marks the absent side, empty files get header-only
//! sections, and executable-bit changes travel as `mode` lines. Batch
//! application is all-or-nothing across files. Merge application is
//! best-effort per file and reports conflicted files in the outcome.

use crate::apply;
use crate::diff::{self, FilePatch, PatchSet, DEV_NULL};
use crate::error::{PatchError, Result};
use crate::types::{ApplyMode, ApplyOutcome, CodecKind, RespatchConfig};
use crate::utils;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, trace};

/// Line-based diff/patch facility
pub trait PatchCodec: fmt::Debug + Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Content section turning `from` into `to`, labelled with `logical`
    ///
    /// `None` on either side means the file is absent. Returns `Ok(None)`
    /// when the contents are identical.
    fn diff(&self, logical: &str, from: Option<&Path>, to: Option<&Path>) -> Result<Option<FilePatch>>;

    /// Apply every section of `patch` to the tree rooted at `target`
    fn apply(&self, target: &Path, patch: &PatchSet, mode: ApplyMode) -> Result<ApplyOutcome>;
}

/// Build the codec selected by `config`
pub fn build_codec(config: &RespatchConfig) -> Box<dyn PatchCodec> {
    match config.codec {
        CodecKind::Builtin => Box::new(BuiltinCodec::new(config.context_lines, config.max_fuzz)),
        CodecKind::External => Box::new(ExternalCodec::new(
            config.diff_program.clone(),
            config.patch_program.clone(),
            config.context_lines,
        )),
    }
}

/// Build the full section for one file, including any `mode` line
///
/// Paths that do not name a regular file are treated as absent.
pub fn create_section(
    codec: &dyn PatchCodec,
    logical: &str,
    from: Option<&Path>,
    to: Option<&Path>,
) -> Result<Option<FilePatch>> {
    utils::validate_logical_path(logical)?;
    let from = from.filter(|p| p.is_file());
    let to = to.filter(|p| p.is_file());

    let mut section = codec.diff(logical, from, to)?;
    if let Some(mode) = mode_change(from, to)? {
        match section.as_mut() {
            Some(section) => section.mode = Some(mode),
            None => section = Some(FilePatch::mode_only(logical, mode)),
        }
    }
    Ok(section)
}

/// Unified diff text turning `from` into `to`, or `None` when nothing differs
pub fn create_patch(
    codec: &dyn PatchCodec,
    logical: &str,
    from: Option<&Path>,
    to: Option<&Path>,
) -> Result<Option<String>> {
    Ok(create_section(codec, logical, from, to)?.map(|s| s.render()))
}

/// Parse `body` and apply it under `target`
pub fn apply_patch(
    codec: &dyn PatchCodec,
    target: &Path,
    body: &str,
    mode: ApplyMode,
) -> Result<ApplyOutcome> {
    let set = PatchSet::parse(body)?;
    if set.is_empty() {
        return Ok(ApplyOutcome::default());
    }
    debug!("Applying {} sections with the {} codec", set.files.len(), codec.name());
    codec.apply(target, &set, mode)
}

/// Permission bits to record when the executable bits differ
fn mode_change(from: Option<&Path>, to: Option<&Path>) -> Result<Option<u32>> {
    let to_mode = match to {
        Some(path) => utils::get_permissions(path)?,
        None => return Ok(None),
    };
    let from_exec = match from {
        Some(path) => utils::get_permissions(path)? & 0o111,
        None => 0,
    };
    if to_mode & 0o111 != from_exec {
        Ok(Some(to_mode & 0o777))
    } else {
        Ok(None)
    }
}

fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>> {
    path.map(fs::read).transpose().map_err(PatchError::from)
}

/// In-process codec built on the `similar` crate
#[derive(Debug, Clone)]
pub struct BuiltinCodec {
    context_lines: usize,
    max_fuzz: usize,
}

impl BuiltinCodec {
    /// Create a codec emitting `context_lines` of context and applying with up to `max_fuzz`
    pub fn new(context_lines: usize, max_fuzz: usize) -> Self {
        Self {
            context_lines,
            max_fuzz,
        }
    }
}

impl Default for BuiltinCodec {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

impl PatchCodec for BuiltinCodec {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn diff(&self, logical: &str, from: Option<&Path>, to: Option<&Path>) -> Result<Option<FilePatch>> {
        let old = read_optional(from)?;
        let new = read_optional(to)?;
        diff::diff_contents(logical, old.as_deref(), new.as_deref(), self.context_lines)
    }

    fn apply(&self, target: &Path, patch: &PatchSet, mode: ApplyMode) -> Result<ApplyOutcome> {
        apply::apply_patch_set(target, patch, mode, self.max_fuzz)
    }
}

/// Codec that shells out to `diff` and `patch`
///
/// Sections without hunks (empty-file creation or deletion, pure mode
/// changes) are not fed to `patch`; they are handled structurally, and `mode`
/// lines are applied after `patch` has run.
#[derive(Debug, Clone)]
pub struct ExternalCodec {
    diff_program: PathBuf,
    patch_program: PathBuf,
    context_lines: usize,
}

impl ExternalCodec {
    /// Create a codec using the given executables
    pub fn new(diff_program: PathBuf, patch_program: PathBuf, context_lines: usize) -> Self {
        Self {
            diff_program,
            patch_program,
            context_lines,
        }
    }

    fn process_error(program: &Path, status: String, stderr: String, context: &str) -> PatchError {
        PatchError::ProcessFailed {
            program: program.display().to_string(),
            status,
            stderr,
            context: context.to_string(),
        }
    }

    fn run_patch(&self, target: &Path, body: &str, mode: ApplyMode, dry_run: bool, context: &str) -> Result<()> {
        let mut cmd = Command::new(&self.patch_program);
        cmd.arg("-p0")
            .arg("-d")
            .arg(target)
            .arg("--forward")
            .arg("--batch")
            .arg("--no-backup-if-mismatch");
        match mode {
            ApplyMode::Batch => cmd.arg("--reject-file=-"),
            ApplyMode::Merge => cmd.arg("--merge"),
        };
        if dry_run {
            cmd.arg("--dry-run");
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

        trace!("Running {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            Self::process_error(&self.patch_program, "not started".to_string(), e.to_string(), context)
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) if mode == ApplyMode::Merge => Ok(()),
            Some(1) => Err(rejection_from_output(&stdout)),
            _ => Err(Self::process_error(
                &self.patch_program,
                output.status.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                context,
            )),
        }
    }
}

/// Find the first failed hunk in `patch` output
fn rejection_from_output(stdout: &str) -> PatchError {
    let mut current = String::from("<unknown>");
    for line in stdout.lines() {
        if let Some(file) = line
            .strip_prefix("patching file ")
            .or_else(|| line.strip_prefix("checking file "))
        {
            current = file.trim().trim_matches(|c| c == '\'' || c == '`').to_string();
        } else if let Some(rest) = line.strip_prefix("Hunk #") {
            if rest.contains("FAILED") {
                let hunk = rest
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                return PatchError::HunkRejected { path: current, hunk };
            }
        }
    }
    PatchError::HunkRejected {
        path: current,
        hunk: 0,
    }
}

impl PatchCodec for ExternalCodec {
    fn name(&self) -> &'static str {
        "external"
    }

    fn diff(&self, logical: &str, from: Option<&Path>, to: Option<&Path>) -> Result<Option<FilePatch>> {
        // Same binary gate as the builtin codec, before diff says "Binary files differ"
        for content in [read_optional(from)?, read_optional(to)?].iter().flatten() {
            diff::decode_text(logical, content)?;
        }

        let output = Command::new(&self.diff_program)
            .arg(format!("-U{}", self.context_lines))
            .arg("--label")
            .arg(if from.is_some() { logical } else { DEV_NULL })
            .arg("--label")
            .arg(if to.is_some() { logical } else { DEV_NULL })
            .arg(from.unwrap_or_else(|| Path::new(DEV_NULL)))
            .arg(to.unwrap_or_else(|| Path::new(DEV_NULL)))
            .output()
            .map_err(|e| {
                Self::process_error(&self.diff_program, "not started".to_string(), e.to_string(), logical)
            })?;

        match output.status.code() {
            Some(0) if from.is_some() == to.is_some() => Ok(None),
            Some(0) => Ok(Some(FilePatch {
                path: logical.to_string(),
                old_absent: from.is_none(),
                new_absent: to.is_none(),
                mode: None,
                hunks: Vec::new(),
            })),
            Some(1) => {
                let text = String::from_utf8(output.stdout)
                    .map_err(|_| PatchError::BinaryContent(logical.to_string()))?;
                let mut set = PatchSet::parse(&text)?;
                if set.files.len() != 1 {
                    return Err(PatchError::internal(format!(
                        "diff produced {} sections for {}",
                        set.files.len(),
                        logical
                    )));
                }
                let mut section = set.files.remove(0);
                section.path = logical.to_string();
                Ok(Some(section))
            }
            _ => Err(Self::process_error(
                &self.diff_program,
                output.status.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                logical,
            )),
        }
    }

    fn apply(&self, target: &Path, patch: &PatchSet, mode: ApplyMode) -> Result<ApplyOutcome> {
        let (content, structural): (Vec<FilePatch>, Vec<FilePatch>) =
            patch.files.iter().cloned().partition(|f| !f.hunks.is_empty());

        let mut existed = Vec::with_capacity(content.len());
        for file in &content {
            existed.push(utils::resolve_logical(target, &file.path)?.is_file());
        }
        let body = PatchSet {
            files: content
                .iter()
                .map(|f| FilePatch {
                    mode: None,
                    ..f.clone()
                })
                .collect(),
        }
        .render();
        let context = content
            .iter()
            .map(|f| f.path.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        if !content.is_empty() && mode == ApplyMode::Batch {
            self.run_patch(target, &body, mode, true, &context)?;
        }
        let mut outcome = apply::apply_patch_set(target, &PatchSet { files: structural }, mode, 0)?;
        if !content.is_empty() {
            self.run_patch(target, &body, mode, false, &context)?;
        }

        for (file, existed) in content.iter().zip(existed) {
            apply::settle_rewritten(target, file, existed, mode, &mut outcome)?;
        }

        Ok(outcome)
    }
}
