//! Content fingerprints for files and directory trees
//!
//! A tree digest is built in three steps:
//!
//! 1. enumerate every regular file below the root (dotfiles included,
//!    directories and symlinks excluded),
//! 2. sort the logical paths bytewise,
//! 3. hash each file in that order and hash the concatenation of the
//!    per-file hex digests.
//!
//! The result does not depend on traversal order or on file metadata. File
//! names do not enter the digest, only the ordered sequence of contents.
//! A missing directory and an empty directory both produce
//! [`EMPTY_TREE_DIGEST`].

use crate::error::{PatchError, Result};
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::trace;
use walkdir::WalkDir;

/// Digest of a tree with no files (SHA-256 of the empty string)
pub const EMPTY_TREE_DIGEST: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Digest arbitrary bytes
pub fn digest(bytes: &[u8]) -> String {
    utils::hash_data(bytes)
}

/// Digest one file's content
pub fn digest_file(path: &Path) -> Result<String> {
    utils::hash_file_content(path)
}

/// Digest a whole tree; `None` is the empty tree
pub fn digest_tree(dir: Option<&Path>) -> Result<String> {
    TreeScanner::new().digest(dir)
}

/// List the logical paths of all regular files under `dir`, sorted
pub fn tracked_files(dir: &Path) -> Result<Vec<String>> {
    TreeScanner::new().files(dir)
}

/// Enumerates and digests trees, optionally skipping ignored paths
///
/// ```rust
/// use respatch::digest::{TreeScanner, EMPTY_TREE_DIGEST};
///
/// # fn main() -> respatch::Result<()> {
/// let scanner = TreeScanner::new().with_ignore_patterns(&["*.log".to_string()])?;
/// assert_eq!(scanner.digest(None)?, EMPTY_TREE_DIGEST);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TreeScanner {
    ignore: Option<GlobSet>,
}

impl TreeScanner {
    /// Scanner that sees every regular file
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip files whose logical path matches any of `patterns`
    ///
    /// A pattern that names a directory (`target` or `target/`) also hides
    /// everything below it.
    pub fn with_ignore_patterns(mut self, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            self.ignore = None;
            return Ok(self);
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim_end_matches('/');
            if trimmed.is_empty() {
                return Err(PatchError::InvalidPattern(pattern.clone()));
            }
            for expanded in [trimmed.to_string(), format!("{}/**", trimmed)] {
                let glob = Glob::new(&expanded)
                    .map_err(|e| PatchError::InvalidPattern(format!("{}: {}", pattern, e)))?;
                builder.add(glob);
            }
        }
        let set = builder
            .build()
            .map_err(|e| PatchError::InvalidPattern(e.to_string()))?;
        self.ignore = Some(set);
        Ok(self)
    }

    /// Whether a logical path is excluded
    pub fn is_ignored(&self, logical: &str) -> bool {
        self.ignore
            .as_ref()
            .map(|set| set.is_match(logical))
            .unwrap_or(false)
    }

    /// Sorted logical paths of all regular, non-ignored files under `dir`
    ///
    /// A missing directory has no files.
    pub fn files(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = utils::make_relative(entry.path(), dir)?;
            let logical = utils::logical_path(&relative)?;
            if self.is_ignored(&logical) {
                trace!("Ignoring {}", logical);
                continue;
            }
            files.push(logical);
        }

        files.sort();
        Ok(files)
    }

    /// Digest of the tree rooted at `dir`
    pub fn digest(&self, dir: Option<&Path>) -> Result<String> {
        let dir = match dir {
            Some(dir) => dir,
            None => return Ok(EMPTY_TREE_DIGEST.to_string()),
        };

        let mut concatenated = String::new();
        for logical in self.files(dir)? {
            let path = utils::resolve_logical(dir, &logical)?;
            concatenated.push_str(&digest_file(&path)?);
        }
        Ok(digest(concatenated.as_bytes()))
    }
}
