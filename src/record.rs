//! Patch records and their on-disk text format
//!
//! A record file is UTF-8 text named `NNNNN.patch`:
//!
//! ```text
//! Before: <64 hex digits>
//! After: <64 hex digits>
//! Patch: <64 hex digits>
//! <unified diff body>
//! ```
//!
//! The `Patch` digest covers exactly the bytes of the body that follow the
//! third header line. It is checked on every parse.

use crate::digest::{self, EMPTY_TREE_DIGEST};
use crate::error::{PatchError, Result};
use crate::utils;
use serde::{Deserialize, Serialize};

/// Highest version the five digit naming scheme can hold
pub const MAX_VERSION: u32 = 99_999;

const BEFORE: &str = "Before: ";
const AFTER: &str = "After: ";
const PATCH: &str = "Patch: ";

/// One numbered link of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Digest of the tree this patch expects to start from
    pub before_digest: String,
    /// Digest of the tree this patch produces
    pub after_digest: String,
    /// Digest of `body`
    pub patch_digest: String,
    /// Unified diff text
    pub body: String,
}

impl PatchRecord {
    /// Create a record, computing the body digest
    pub fn new(before_digest: impl Into<String>, after_digest: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            before_digest: before_digest.into(),
            after_digest: after_digest.into(),
            patch_digest: digest::digest(body.as_bytes()),
            body,
        }
    }

    /// Whether the `Before:` side is the empty tree
    ///
    /// True for the chain head, but also for a delta whose newer version is
    /// an emptied tree, so only the position in the chain says which is the
    /// snapshot.
    pub fn starts_from_empty(&self) -> bool {
        self.before_digest == EMPTY_TREE_DIGEST
    }

    /// Check the body against `patch_digest`
    pub fn verify(&self, version: u32) -> Result<()> {
        let actual = digest::digest(self.body.as_bytes());
        if actual != self.patch_digest {
            return Err(PatchError::PatchDigestMismatch {
                version,
                expected: self.patch_digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Serialize to the on-disk text format
    pub fn to_text(&self) -> String {
        format!(
            "{}{}\n{}{}\n{}{}\n{}",
            BEFORE, self.before_digest, AFTER, self.after_digest, PATCH, self.patch_digest, self.body
        )
    }

    /// Parse the on-disk text format and verify the body digest
    pub fn parse(version: u32, text: &str) -> Result<Self> {
        let record = Self::parse_unverified(version, text)?;
        record.verify(version)?;
        Ok(record)
    }

    /// Parse the header lines without checking the body digest
    ///
    /// Only for maintenance paths that rewrite the digest afterwards.
    pub(crate) fn parse_unverified(version: u32, text: &str) -> Result<Self> {
        let mut rest = text;
        let mut headers = Vec::with_capacity(3);

        for prefix in [BEFORE, AFTER, PATCH] {
            let (line, tail) = match rest.split_once('\n') {
                Some(split) => split,
                None => {
                    return Err(PatchError::malformed_record(
                        version,
                        format!("missing '{}' header line", prefix.trim_end()),
                    ))
                }
            };
            let value = line.strip_prefix(prefix).ok_or_else(|| {
                PatchError::malformed_record(
                    version,
                    format!("expected '{}' header, found {:?}", prefix.trim_end(), line),
                )
            })?;
            if !utils::is_hex_digest(value) {
                return Err(PatchError::malformed_record(
                    version,
                    format!("'{}' is not a hex digest: {:?}", prefix.trim_end(), value),
                ));
            }
            headers.push(value.to_string());
            rest = tail;
        }

        Ok(Self {
            patch_digest: headers.pop().unwrap_or_default(),
            after_digest: headers.pop().unwrap_or_default(),
            before_digest: headers.pop().unwrap_or_default(),
            body: rest.to_string(),
        })
    }
}

/// File name of the record for `version`
pub fn record_file_name(version: u32) -> String {
    format!("{:05}.patch", version)
}

/// Version encoded in a record file name, if it follows the naming scheme
pub fn parse_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".patch")?;
    if stem.len() != 5 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
