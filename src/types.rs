//! Core data types used throughout the respatch library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Addressing**: [`VersionSpec`] - how callers name a version
//! - **Application**: [`ApplyMode`], [`ApplyOutcome`] - how a diff is applied and what happened
//! - **Results**: [`DeployResult`], [`MigrationResult`], [`FileMigration`] - operation reports
//! - **Configuration**: [`RespatchConfig`], [`CodecKind`] - engine parameters
//!
//! ## Examples
//!
//! ```rust
//! use respatch::types::{RespatchConfig, CodecKind};
//!
//! let config = RespatchConfig {
//!     codec: CodecKind::Builtin,
//!     max_fuzz: 1,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming the `diff` executable
pub const DIFF_PROGRAM_ENV: &str = "RESPATCH_DIFF";

/// Environment variable naming the `patch` executable
pub const PATCH_PROGRAM_ENV: &str = "RESPATCH_PATCH";

/// A version as requested by a caller
///
/// Parsing accepts the literal `latest` or a non-negative integer. Range
/// checks against the chain happen later, in [`crate::store::PatchStore::validate_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionSpec {
    /// Whatever the chain head is when the request is resolved
    Latest,
    /// A specific version number
    Exact(u32),
}

impl FromStr for VersionSpec {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(VersionSpec::Latest);
        }
        trimmed
            .parse::<u32>()
            .map(VersionSpec::Exact)
            .map_err(|_| PatchError::InvalidVersion {
                value: s.to_string(),
                min: 0,
                max: crate::record::MAX_VERSION,
            })
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Latest => write!(f, "latest"),
            VersionSpec::Exact(v) => write!(f, "{}", v),
        }
    }
}

impl From<u32> for VersionSpec {
    fn from(v: u32) -> Self {
        VersionSpec::Exact(v)
    }
}

/// How a unified diff is applied to a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMode {
    /// Non-interactive; any unplaceable hunk fails the whole application
    #[default]
    Batch,
    /// Unplaceable hunks become inline conflict markers in the affected file
    Merge,
}

/// What happened when a diff was applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Files whose content or mode was changed in place
    pub files_patched: Vec<String>,
    /// Files that did not exist before
    pub files_created: Vec<String>,
    /// Files removed because the diff deleted them
    pub files_deleted: Vec<String>,
    /// Files that now contain conflict markers
    pub conflicts: Vec<String>,
}

impl ApplyOutcome {
    /// Whether any conflict markers were introduced
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Total number of files touched
    pub fn files_touched(&self) -> usize {
        self.files_patched.len() + self.files_created.len() + self.files_deleted.len()
    }

    /// Fold another outcome into this one
    pub fn merge(&mut self, other: ApplyOutcome) {
        self.files_patched.extend(other.files_patched);
        self.files_created.extend(other.files_created);
        self.files_deleted.extend(other.files_deleted);
        self.conflicts.extend(other.conflicts);
    }
}

/// Result of deploying a version into an empty directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    /// Version that was materialized
    pub version: u32,
    /// Directory that now holds it
    pub target: PathBuf,
    /// Number of regular files in the deployed tree
    pub files_deployed: usize,
    /// Number of patch records replayed
    pub records_applied: usize,
    /// Digest of the deployed tree
    pub tree_digest: String,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

/// Whether an application finished cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    /// Every hunk applied
    Clean,
    /// Some files now carry conflict markers
    WithConflicts,
}

/// Progress of a single upgrade
///
/// `NotStarted -> VersionsReconstructed -> PatchesBuilt -> Applied`. Integrity
/// failures end the upgrade with an error instead of a state, and always before
/// the deployed tree is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    /// Nothing done yet
    NotStarted,
    /// Snapshots for every version in range exist in scratch space
    VersionsReconstructed,
    /// Per-file patches have been computed
    PatchesBuilt,
    /// The consolidated patch has been applied
    Applied(ApplyStatus),
}

impl MigrationState {
    /// Whether moving to `next` is a legal step
    pub fn can_advance_to(&self, next: MigrationState) -> bool {
        matches!(
            (self, next),
            (MigrationState::NotStarted, MigrationState::VersionsReconstructed)
                | (MigrationState::NotStarted, MigrationState::Applied(ApplyStatus::Clean))
                | (MigrationState::VersionsReconstructed, MigrationState::PatchesBuilt)
                | (MigrationState::PatchesBuilt, MigrationState::Applied(_))
        )
    }
}

/// What the reconciler decided for one tracked file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAction {
    /// Deployed content already equals the target version
    UpToDate,
    /// Upstream did not change the file between the match point and the target
    NoUpstreamChange,
    /// The deployed file was removed locally and matches no version; left alone
    LocallyRemoved,
    /// Patched cleanly
    Patched,
    /// Patched with inline conflict markers
    Conflicted,
}

/// Per-file migration report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMigration {
    /// Logical path relative to the deployed tree
    pub path: String,
    /// Highest version whose content matches the deployed file
    pub match_point: u32,
    /// Whether the match point was found rather than defaulted
    pub matched: bool,
    /// Decision taken
    pub action: FileAction,
}

/// Result of migrating a deployed tree between versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Version the client was recorded at
    pub from_version: u32,
    /// Version the client was moved to
    pub to_version: u32,
    /// Final state of the upgrade
    pub state: MigrationState,
    /// Per-file decisions, sorted by path
    pub files: Vec<FileMigration>,
    /// Outcome of the consolidated application
    pub outcome: ApplyOutcome,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl MigrationResult {
    /// Whether any file was left with conflict markers
    pub fn has_conflicts(&self) -> bool {
        self.outcome.has_conflicts()
    }

    /// Files that received a patch (clean or conflicted)
    pub fn patched_files(&self) -> impl Iterator<Item = &FileMigration> {
        self.files
            .iter()
            .filter(|f| matches!(f.action, FileAction::Patched | FileAction::Conflicted))
    }
}

/// Which Patch Codec implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// In-process diff and hunk application
    #[default]
    Builtin,
    /// External `diff` and `patch` executables
    External,
}

/// Configuration for a [`crate::Respatch`] instance
///
/// Sources, lowest precedence first: [`Default`], a JSON file
/// ([`RespatchConfig::load`]), the environment ([`RespatchConfig::apply_env`]),
/// then builder overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RespatchConfig {
    /// Codec used for diffing and patching
    pub codec: CodecKind,
    /// `diff` executable for the external codec
    pub diff_program: PathBuf,
    /// `patch` executable for the external codec
    pub patch_program: PathBuf,
    /// Unchanged lines emitted around each hunk
    pub context_lines: usize,
    /// Context lines the applier may ignore at each end of a hunk
    pub max_fuzz: usize,
    /// Glob patterns excluded when snapshotting a tree for commit
    pub ignore_patterns: Vec<String>,
}

impl Default for RespatchConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Builtin,
            diff_program: PathBuf::from("diff"),
            patch_program: PathBuf::from("patch"),
            context_lines: 3,
            max_fuzz: 2,
            ignore_patterns: Vec::new(),
        }
    }
}

impl RespatchConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: RespatchConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay executable locations from the environment
    pub fn apply_env(mut self) -> Self {
        if let Some(diff) = std::env::var_os(DIFF_PROGRAM_ENV).filter(|v| !v.is_empty()) {
            self.diff_program = PathBuf::from(diff);
        }
        if let Some(patch) = std::env::var_os(PATCH_PROGRAM_ENV).filter(|v| !v.is_empty()) {
            self.patch_program = PathBuf::from(patch);
        }
        self
    }

    /// Check that values are usable
    pub fn validate(&self) -> Result<()> {
        if self.context_lines == 0 {
            return Err(PatchError::InvalidConfiguration(
                "context_lines must be at least 1".to_string(),
            ));
        }
        if self.max_fuzz > self.context_lines {
            return Err(PatchError::InvalidConfiguration(format!(
                "max_fuzz ({}) must not exceed context_lines ({})",
                self.max_fuzz, self.context_lines
            )));
        }
        if self.diff_program.as_os_str().is_empty() || self.patch_program.as_os_str().is_empty() {
            return Err(PatchError::InvalidConfiguration(
                "diff_program and patch_program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
