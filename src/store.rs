//! Patch Record Store
//!
//! The store is a single flat directory of `NNNNN.patch` files. There is no
//! index file: the directory listing is the index. [`PatchStore`] scans it once
//! when opened and keeps the set of versions in memory, updating it as records
//! are committed.
//!
//! ```text
//! patches/
//! ├── 00001.patch   # backward delta: tree 2 -> tree 1
//! ├── 00002.patch   # backward delta: tree 3 -> tree 2
//! └── 00003.patch   # head: empty tree -> tree 3
//! ```
//!
//! Every read checks the record body against its `Patch:` digest, so a hand
//! edited or truncated file is never applied silently.

use crate::error::{PatchError, Result};
use crate::record::{self, PatchRecord, MAX_VERSION};
use crate::types::VersionSpec;
use crate::utils;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Scan `dir` and return the highest record version, or 0 if there are none
///
/// A missing directory holds no records.
pub fn latest_version(dir: &Path) -> Result<u32> {
    Ok(scan_versions(dir)?.last().copied().unwrap_or(0))
}

/// Parse a user-supplied version: `latest` or a non-negative integer
pub fn parse_version(text: &str) -> Result<VersionSpec> {
    text.parse()
}

fn scan_versions(dir: &Path) -> Result<BTreeSet<u32>> {
    let mut versions = BTreeSet::new();
    if !dir.exists() {
        return Ok(versions);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        match name.to_str().and_then(record::parse_file_name) {
            Some(0) | None => trace!("Skipping {:?}", name),
            Some(version) => {
                versions.insert(version);
            }
        }
    }
    Ok(versions)
}

/// The two writes that make up one commit
///
/// `head` is the new snapshot record at `latest + 1`; `rewrite` replaces the
/// previous head with a backward delta when the chain was not empty.
#[derive(Debug, Clone)]
pub struct CommitTransaction {
    /// New head version and its snapshot record
    pub head: (u32, PatchRecord),
    /// Previous head version and its replacement delta
    pub rewrite: Option<(u32, PatchRecord)>,
}

/// Directory of numbered patch records with an in-memory version index
#[derive(Debug, Clone)]
pub struct PatchStore {
    dir: PathBuf,
    versions: BTreeSet<u32>,
}

impl PatchStore {
    /// Open (creating if needed) the store at `dir` and index its records
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let versions = scan_versions(&dir)?;
        debug!("Opened patch store {:?} with {} records", dir, versions.len());
        Ok(Self { dir, versions })
    }

    /// Directory holding the records
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Highest committed version, 0 when empty
    pub fn latest(&self) -> u32 {
        self.versions.last().copied().unwrap_or(0)
    }

    /// All committed versions in ascending order
    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.versions.iter().copied()
    }

    /// Path of the record file for `version`
    pub fn record_path(&self, version: u32) -> PathBuf {
        self.dir.join(record::record_file_name(version))
    }

    /// Re-scan the directory, picking up records written by someone else
    pub fn refresh(&mut self) -> Result<()> {
        self.versions = scan_versions(&self.dir)?;
        Ok(())
    }

    /// Reject `version` unless it lies in `[min, latest]`
    pub fn validate_version(&self, version: u32, min: u32) -> Result<u32> {
        let latest = self.latest();
        if version < min || version > latest {
            return Err(PatchError::InvalidVersion {
                value: version.to_string(),
                min,
                max: latest,
            });
        }
        Ok(version)
    }

    /// Turn a [`VersionSpec`] into a concrete, validated version
    pub fn resolve(&self, spec: VersionSpec, min: u32) -> Result<u32> {
        match spec {
            VersionSpec::Latest => self.validate_version(self.latest(), min),
            VersionSpec::Exact(version) => self.validate_version(version, min),
        }
    }

    /// Read and digest-check the record for `version`
    pub fn read(&self, version: u32) -> Result<PatchRecord> {
        let path = self.record_path(version);
        if !path.is_file() {
            return Err(PatchError::RecordNotFound(version));
        }
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => {
                PatchError::malformed_record(version, "record is not valid UTF-8")
            }
            _ => PatchError::Io(e),
        })?;
        let record = PatchRecord::parse(version, &text)?;
        trace!("Read record {:05} ({} bytes of diff)", version, record.body.len());
        Ok(record)
    }

    /// Write the record for `version`, replacing any existing file
    pub fn write(&mut self, version: u32, record: &PatchRecord) -> Result<()> {
        if version == 0 || version > MAX_VERSION {
            return Err(PatchError::InvalidVersion {
                value: version.to_string(),
                min: 1,
                max: MAX_VERSION,
            });
        }
        utils::atomic_write(&self.record_path(version), record.to_text().as_bytes())?;
        self.versions.insert(version);
        debug!("Wrote record {:05}", version);
        Ok(())
    }

    /// Apply a commit: write the new head, then rewrite its predecessor
    ///
    /// Both records are staged next to their final names before either is
    /// renamed into place. The head goes first so that an interruption
    /// leaves a chain whose newest record is still a complete snapshot.
    pub fn commit(&mut self, transaction: CommitTransaction) -> Result<u32> {
        let latest = self.latest();
        let (head_version, head) = &transaction.head;

        if latest >= MAX_VERSION {
            return Err(PatchError::ChainFull(MAX_VERSION));
        }
        if *head_version != latest + 1 {
            return Err(PatchError::internal(format!(
                "new head must be version {}, got {}",
                latest + 1,
                head_version
            )));
        }
        match &transaction.rewrite {
            Some((version, _)) if *version != latest => {
                return Err(PatchError::internal(format!(
                    "only the current head {} can be rewritten, got {}",
                    latest, version
                )))
            }
            None if latest > 0 => {
                return Err(PatchError::internal("previous head must be rewritten"))
            }
            _ => {}
        }

        let mut staged = vec![(*head_version, head)];
        if let Some((version, record)) = &transaction.rewrite {
            staged.push((*version, record));
        }

        // Dropping a staged file before it is persisted removes it
        let mut temps = Vec::with_capacity(staged.len());
        for (version, record) in &staged {
            let final_path = self.record_path(*version);
            let temp = utils::stage_beside(&final_path, record.to_text().as_bytes())?;
            temps.push((temp, final_path));
        }

        for (temp, final_path) in temps {
            temp.persist(&final_path).map_err(|e| e.error)?;
        }

        self.versions.insert(*head_version);
        info!("Committed version {}", head_version);
        Ok(*head_version)
    }

    /// Recompute the `Patch:` digest of a hand-edited record
    ///
    /// This is a maintenance escape hatch. Returns whether the digest changed.
    pub fn reseal(&mut self, version: u32) -> Result<bool> {
        let path = self.record_path(version);
        if !path.is_file() {
            return Err(PatchError::RecordNotFound(version));
        }
        let text = fs::read_to_string(&path)?;
        let stale = PatchRecord::parse_unverified(version, &text)?;
        let resealed = PatchRecord::new(stale.before_digest, stale.after_digest, stale.body);

        if resealed.patch_digest == stale.patch_digest {
            debug!("Record {:05} digest already current", version);
            return Ok(false);
        }

        warn!(
            "Resealing record {:05}: {} -> {}",
            version, stale.patch_digest, resealed.patch_digest
        );
        self.write(version, &resealed)?;
        Ok(true)
    }
}
