//! Chain Builder
//!
//! Committing a new tree produces two records in one transaction:
//!
//! 1. the new head `prev + 1`, a full snapshot diffed from the empty tree, and
//! 2. a replacement for the old head `prev`, a backward delta that turns the
//!    new tree back into the old one.
//!
//! Only the head ever stores full content. Every other record is a delta to
//! its successor, so history grows with the size of the changes rather than
//! with the number of versions.

use crate::codec::{self, PatchCodec};
use crate::digest::{TreeScanner, EMPTY_TREE_DIGEST};
use crate::error::{PatchError, Result};
use crate::record::{PatchRecord, MAX_VERSION};
use crate::store::{CommitTransaction, PatchStore};
use crate::utils;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Builds new chain entries from directory trees
#[derive(Debug)]
pub struct ChainBuilder<'a> {
    store: &'a mut PatchStore,
    codec: &'a dyn PatchCodec,
    scanner: &'a TreeScanner,
}

impl<'a> ChainBuilder<'a> {
    /// Create a builder writing into `store`
    pub fn new(store: &'a mut PatchStore, codec: &'a dyn PatchCodec, scanner: &'a TreeScanner) -> Self {
        Self {
            store,
            codec,
            scanner,
        }
    }

    /// Commit `to` as the next version, given that `from` is the current head
    ///
    /// `from` must reproduce the head record's `After:` digest (or be absent
    /// or empty when the chain is empty). Returns `None` when the trees are
    /// identical and nothing was written.
    ///
    /// # Errors
    ///
    /// - [`PatchError::ChainMismatch`] if `from` is not the current head
    /// - [`PatchError::ChainFull`] if no version number is left
    /// - codec errors for binary or unreadable files
    pub fn create(&mut self, from: Option<&Path>, to: &Path) -> Result<Option<u32>> {
        let from = from.filter(|dir| dir.exists());
        let prev = self.store.latest();

        let from_digest = self.scanner.digest(from)?;
        let head_digest = if prev > 0 {
            self.store.read(prev)?.after_digest
        } else {
            EMPTY_TREE_DIGEST.to_string()
        };
        if from_digest != head_digest {
            return Err(PatchError::ChainMismatch {
                version: prev,
                expected: head_digest,
                actual: from_digest,
            });
        }
        if prev >= MAX_VERSION {
            return Err(PatchError::ChainFull(MAX_VERSION));
        }

        let backward = self.tree_diff(Some(to), from)?;
        if backward.is_empty() {
            info!("Tree {:?} is identical to version {}; nothing to commit", to, prev);
            return Ok(None);
        }

        let to_digest = self.scanner.digest(Some(to))?;
        let forward = self.tree_diff(None, Some(to))?;
        debug!(
            "Version {}: {} bytes of snapshot, {} bytes of backward delta",
            prev + 1,
            forward.len(),
            backward.len()
        );

        let transaction = CommitTransaction {
            head: (prev + 1, PatchRecord::new(EMPTY_TREE_DIGEST, to_digest.clone(), forward)),
            rewrite: (prev > 0).then(|| (prev, PatchRecord::new(to_digest, from_digest, backward))),
        };
        self.store.commit(transaction).map(Some)
    }

    /// Consolidated diff over the union of both trees' files, sorted by path
    fn tree_diff(&self, from: Option<&Path>, to: Option<&Path>) -> Result<String> {
        let mut paths = BTreeSet::new();
        for dir in [from, to].into_iter().flatten() {
            paths.extend(self.scanner.files(dir)?);
        }

        let mut body = String::new();
        for logical in &paths {
            let old = from.map(|dir| utils::resolve_logical(dir, logical)).transpose()?;
            let new = to.map(|dir| utils::resolve_logical(dir, logical)).transpose()?;
            if let Some(section) = codec::create_patch(self.codec, logical, old.as_deref(), new.as_deref())? {
                body.push_str(&section);
            }
        }
        Ok(body)
    }
}
