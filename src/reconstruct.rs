//! Reconstructor: replaying the backward chain
//!
//! Version `latest` is rebuilt from the empty tree by its snapshot record.
//! Every lower version `v` is rebuilt from `v + 1` by record `v`. Before each
//! record is applied the tree must hash to its `Before:` digest, and afterwards
//! to its `After:` digest. Any disagreement is fatal.
//!
//! All records needed for an operation are read (and digest-checked) before
//! the first one is applied.

use crate::codec::{self, PatchCodec};
use crate::digest::{self, EMPTY_TREE_DIGEST};
use crate::error::{PatchError, Result};
use crate::record::PatchRecord;
use crate::store::PatchStore;
use crate::types::{ApplyMode, DeployResult};
use crate::utils;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Scratch snapshots of a contiguous range of versions
///
/// All snapshot directories are siblings under one temporary root that is
/// removed when the set is dropped.
#[derive(Debug)]
pub struct SnapshotSet {
    root: TempDir,
    dirs: BTreeMap<u32, PathBuf>,
}

impl SnapshotSet {
    /// Scratch root holding every snapshot
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Directory holding the tree of `version`
    pub fn get(&self, version: u32) -> Option<&Path> {
        self.dirs.get(&version).map(PathBuf::as_path)
    }

    /// Versions present, ascending
    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirs.keys().copied()
    }

    /// Path of `logical` in the snapshot of `version`, if that file exists there
    pub fn file(&self, version: u32, logical: &str) -> Result<Option<PathBuf>> {
        let dir = self
            .get(version)
            .ok_or_else(|| PatchError::internal(format!("version {} not in snapshot set", version)))?;
        let path = utils::resolve_logical(dir, logical)?;
        Ok(path.is_file().then_some(path))
    }

    /// Sorted union of the files present in any snapshot
    pub fn all_files(&self) -> Result<Vec<String>> {
        let mut files = std::collections::BTreeSet::new();
        for dir in self.dirs.values() {
            files.extend(digest::tracked_files(dir)?);
        }
        Ok(files.into_iter().collect())
    }
}

/// Materializes versions of the chain
#[derive(Debug)]
pub struct Reconstructor<'a> {
    store: &'a PatchStore,
    codec: &'a dyn PatchCodec,
}

impl<'a> Reconstructor<'a> {
    /// Create a reconstructor over `store`
    pub fn new(store: &'a PatchStore, codec: &'a dyn PatchCodec) -> Self {
        Self { store, codec }
    }

    /// Deploy `version` into `target`, which must be empty or missing
    ///
    /// On failure the target is emptied again.
    pub fn deploy(&self, target: &Path, version: u32) -> Result<DeployResult> {
        let start = Instant::now();
        let version = self.store.validate_version(version, 0)?;
        if !utils::is_dir_empty(target)? {
            return Err(PatchError::DirectoryNotEmpty(target.to_path_buf()));
        }

        // Version 0 is the empty tree
        let records = if version == 0 {
            Vec::new()
        } else {
            self.load_records(version)?
        };
        fs::create_dir_all(target)?;

        for (v, record) in &records {
            if let Err(e) = self.apply_record(target, *v, record) {
                warn!("Deploy of version {} failed at record {:05}: {}", version, v, e);
                utils::clear_dir(target)?;
                return Err(e);
            }
        }

        let tree_digest = digest::digest_tree(Some(target))?;
        let files_deployed = digest::tracked_files(target)?.len();
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Deployed version {} into {:?} ({} files, {} records) in {}ms",
            version,
            target,
            files_deployed,
            records.len(),
            duration_ms
        );

        Ok(DeployResult {
            version,
            target: target.to_path_buf(),
            files_deployed,
            records_applied: records.len(),
            tree_digest,
            duration_ms,
        })
    }

    /// Snapshot every version in `from..=to` into scratch space
    ///
    /// The chain is replayed once: the tree for `to` is deployed, then each
    /// lower version starts as a copy of the one above it.
    pub fn reconstruct_range(&self, from: u32, to: u32) -> Result<SnapshotSet> {
        if from > to {
            return Err(PatchError::InvalidRange { from, to });
        }
        self.store.validate_version(to, 0)?;

        let records: BTreeMap<u32, PatchRecord> = self.load_records(from)?.into_iter().collect();
        let root = tempfile::Builder::new().prefix("respatch-").tempdir()?;
        let mut dirs = BTreeMap::new();

        let top = root.path().join(format!("{:05}", to));
        fs::create_dir_all(&top)?;
        if to > 0 {
            for (v, record) in records.range(to..).rev() {
                self.apply_record(&top, *v, record)?;
            }
        }
        dirs.insert(to, top);

        for v in (from..to).rev() {
            let dir = root.path().join(format!("{:05}", v));
            if v == 0 {
                fs::create_dir_all(&dir)?;
            } else {
                let above = dirs
                    .get(&(v + 1))
                    .ok_or_else(|| PatchError::internal(format!("snapshot {} missing", v + 1)))?;
                utils::copy_tree(above, &dir)?;
                let record = records.get(&v).ok_or(PatchError::RecordNotFound(v))?;
                self.apply_record(&dir, v, record)?;
            }
            dirs.insert(v, dir);
        }

        debug!("Reconstructed versions {}..={} under {:?}", from, to, root.path());
        Ok(SnapshotSet { root, dirs })
    }

    /// Read records `latest` down to `max(down_to, 1)`, newest first
    fn load_records(&self, down_to: u32) -> Result<Vec<(u32, PatchRecord)>> {
        let latest = self.store.latest();
        let mut records = Vec::new();
        for v in (down_to.max(1)..=latest).rev() {
            records.push((v, self.store.read(v)?));
        }
        if let Some((v, head)) = records.first() {
            if *v == latest && head.before_digest != EMPTY_TREE_DIGEST {
                return Err(PatchError::CorruptionDetected(format!(
                    "head record {:05} is not a snapshot",
                    v
                )));
            }
        }
        Ok(records)
    }

    /// Apply one record to `dir`, checking both tree digests
    pub(crate) fn apply_record(&self, dir: &Path, version: u32, record: &PatchRecord) -> Result<()> {
        let before = digest::digest_tree(Some(dir))?;
        if before != record.before_digest {
            return Err(PatchError::DigestMismatch {
                version,
                stage: "before",
                expected: record.before_digest.clone(),
                actual: before,
            });
        }

        codec::apply_patch(self.codec, dir, &record.body, ApplyMode::Batch)?;

        let after = digest::digest_tree(Some(dir))?;
        if after != record.after_digest {
            return Err(PatchError::DigestMismatch {
                version,
                stage: "after",
                expected: record.after_digest.clone(),
                actual: after,
            });
        }
        debug!("Applied record {:05}", version);
        Ok(())
    }
}
