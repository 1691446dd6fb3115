//! Error types for the respatch library
//!
//! Every failure the engine can produce is a [`PatchError`]. The variants fall
//! into four families:
//!
//! - **Integrity failures**: a record whose body does not hash to its `Patch:`
//!   header, or a tree whose digest disagrees with a record's `Before:`/`After:`
//!   header during replay. These are fatal and never retried.
//! - **Process failures**: an external `diff`/`patch` exited with a status that
//!   signals trouble rather than a result.
//! - **Rejections**: a hunk that cannot be placed while applying in batch mode.
//!   In merge mode the same situation becomes an inline conflict instead.
//! - **Precondition violations**: bad version numbers, inverted ranges,
//!   non-empty deploy targets. These are raised before any I/O happens.
//!
//! Conflicts produced in merge mode are *not* errors; they are reported through
//! [`crate::types::ApplyOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the respatch library
pub type Result<T> = std::result::Result<T, PatchError>;

/// Main error type for all respatch operations
#[derive(Debug, Error)]
pub enum PatchError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors reading or writing JSON configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Ignore pattern could not be compiled
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// A patch record body does not hash to its recorded digest
    #[error("Patch digest mismatch in version {version} - expected: {expected}, actual: {actual}")]
    PatchDigestMismatch {
        /// Version whose record failed the check
        version: u32,
        /// Digest stored in the `Patch:` header
        expected: String,
        /// Digest recomputed from the body
        actual: String,
    },

    /// A reconstructed tree does not match a record's before/after digest
    #[error("{stage} digest mismatch at version {version} - expected: {expected}, actual: {actual}")]
    DigestMismatch {
        /// Version being applied
        version: u32,
        /// Which header was checked ("before" or "after")
        stage: &'static str,
        /// Digest recorded in the patch header
        expected: String,
        /// Digest computed from the tree on disk
        actual: String,
    },

    /// Generic corruption that does not fit a more specific variant
    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    /// Patch file does not follow the on-disk record format
    #[error("Malformed patch record {version:05}: {reason}")]
    MalformedRecord {
        /// Version of the offending record
        version: u32,
        /// What was wrong with it
        reason: String,
    },

    /// Unified diff body could not be parsed
    #[error("Malformed diff at line {line}: {reason}")]
    MalformedDiff {
        /// 1-based line number within the diff body
        line: usize,
        /// What was wrong with it
        reason: String,
    },

    /// Record for a version does not exist on disk
    #[error("Patch record {0:05} not found")]
    RecordNotFound(u32),

    /// External program exited with an unexpected status
    #[error("{program} failed ({status}) while processing {context}: {stderr}")]
    ProcessFailed {
        /// Program that was run
        program: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
        /// Logical file or version being processed
        context: String,
    },

    /// A hunk could not be placed while applying in batch mode
    #[error("Hunk #{hunk} of {path} could not be applied")]
    HunkRejected {
        /// Logical path of the file
        path: String,
        /// 1-based hunk number within the file section
        hunk: usize,
    },

    /// A section modifies a file the target tree does not have
    #[error("File to patch does not exist: {0}")]
    TargetMissing(String),

    /// File content is not line-oriented text
    #[error("Binary content cannot be diffed: {0}")]
    BinaryContent(String),

    /// Version is not an integer or lies outside the allowed range
    #[error("Invalid version {value}: expected an integer in [{min}, {max}]")]
    InvalidVersion {
        /// Rejected input
        value: String,
        /// Lowest acceptable version
        min: u32,
        /// Highest acceptable version
        max: u32,
    },

    /// Migration range is inverted
    #[error("Invalid range: cannot migrate from version {from} to {to}")]
    InvalidRange {
        /// Starting version
        from: u32,
        /// Target version
        to: u32,
    },

    /// Deploy target already contains entries
    #[error("Target directory is not empty: {0:?}")]
    DirectoryNotEmpty(PathBuf),

    /// Logical path escapes the tree or is otherwise unusable
    #[error("Invalid path in patch: {0}")]
    InvalidPath(String),

    /// The `from` tree of a commit is not the current head of the chain
    #[error("Source tree does not match chain head {version} - expected: {expected}, actual: {actual}")]
    ChainMismatch {
        /// Current head version
        version: u32,
        /// Digest of the head tree
        expected: String,
        /// Digest of the supplied source tree
        actual: String,
    },

    /// No more version numbers fit the five digit naming scheme
    #[error("Patch chain is full ({0} versions)")]
    ChainFull(u32),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PatchError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        PatchError::Internal(msg.into())
    }

    /// Create a malformed record error
    pub fn malformed_record(version: u32, reason: impl Into<String>) -> Self {
        PatchError::MalformedRecord {
            version,
            reason: reason.into(),
        }
    }

    /// Create a malformed diff error
    pub fn malformed_diff(line: usize, reason: impl Into<String>) -> Self {
        PatchError::MalformedDiff {
            line,
            reason: reason.into(),
        }
    }

    /// Check if this error indicates corruption of stored history
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            PatchError::PatchDigestMismatch { .. }
                | PatchError::DigestMismatch { .. }
                | PatchError::CorruptionDetected(_)
                | PatchError::MalformedRecord { .. }
        )
    }

    /// Check if this error was raised before any I/O took place
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PatchError::InvalidVersion { .. }
                | PatchError::InvalidRange { .. }
                | PatchError::DirectoryNotEmpty(_)
                | PatchError::InvalidPath(_)
                | PatchError::ChainMismatch { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            PatchError::PatchDigestMismatch { version, .. } => {
                format!(
                    "Patch file {:05}.patch has been modified or truncated. Restore it from version \
                     control, or run 'respatch reseal {}' if the edit was intentional.",
                    version, version
                )
            }
            PatchError::DirectoryNotEmpty(path) => {
                format!("{:?} is not empty. Deploy into a new or empty directory.", path)
            }
            PatchError::ChainMismatch { version, .. } => {
                format!(
                    "The source tree is not version {}. Omit --from to diff against the chain head.",
                    version
                )
            }
            PatchError::ProcessFailed { program, .. } => {
                format!(
                    "{}. Check that '{}' is installed, or set RESPATCH_DIFF / RESPATCH_PATCH.",
                    self, program
                )
            }
            _ => self.to_string(),
        }
    }
}
