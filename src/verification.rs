//! Whole-chain verification
//!
//! [`ChainVerifier`] checks everything a deploy would check, for every
//! version at once, and reports problems instead of stopping at the first:
//!
//! 1. **Record level**: every version `1..=latest` has a file, the file parses,
//!    and its body hashes to its `Patch:` header
//! 2. **Shape**: the head record is a snapshot rooted at the empty tree
//! 3. **Replay**: the chain is replayed from the head down to version 1 in
//!    scratch space, checking each record's `Before:` and `After:` digests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use respatch::Respatch;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let respatch = Respatch::open("patches")?;
//! let report = respatch.verify()?;
//! if !report.is_valid() {
//!     eprintln!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

use crate::codec::PatchCodec;
use crate::digest::EMPTY_TREE_DIGEST;
use crate::error::{PatchError, Result};
use crate::reconstruct::Reconstructor;
use crate::record::PatchRecord;
use crate::store::PatchStore;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Verifies every record of a chain
#[derive(Debug)]
pub struct ChainVerifier<'a> {
    store: &'a PatchStore,
    codec: &'a dyn PatchCodec,
}

impl<'a> ChainVerifier<'a> {
    /// Create a verifier over `store`
    pub fn new(store: &'a PatchStore, codec: &'a dyn PatchCodec) -> Self {
        Self { store, codec }
    }

    /// Check every record and replay the whole chain
    ///
    /// Corruption ends up in the report. Only failures of the verifier
    /// itself (such as being unable to create scratch space) are errors.
    pub fn verify(&self) -> Result<ChainVerificationReport> {
        let start = Instant::now();
        let latest = self.store.latest();
        let mut report = ChainVerificationReport::new(latest);

        let mut loaded: Vec<(u32, Option<PatchRecord>)> = Vec::new();
        for version in (1..=latest).rev() {
            let mut check = RecordVerification::new(version);
            let record = match self.store.read(version) {
                Ok(record) => {
                    check.patch_digest_valid = true;
                    check.is_snapshot = version == latest;
                    Some(record)
                }
                Err(e) => {
                    warn!("Record {:05} unreadable: {}", version, e);
                    check.error = Some(e.to_string());
                    None
                }
            };
            if version == latest {
                if let Some(record) = &record {
                    if record.before_digest != EMPTY_TREE_DIGEST {
                        check.error = Some("head record is not a snapshot of the empty tree".to_string());
                    }
                }
            }
            report.records.push(check);
            loaded.push((version, record));
        }

        self.replay(&loaded, &mut report)?;
        report.records.sort_by_key(|r| r.version);
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        if report.is_valid() {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    fn replay(&self, loaded: &[(u32, Option<PatchRecord>)], report: &mut ChainVerificationReport) -> Result<()> {
        let scratch = tempfile::Builder::new().prefix("respatch-verify-").tempdir()?;
        let reconstructor = Reconstructor::new(self.store, self.codec);

        for (index, (version, record)) in loaded.iter().enumerate() {
            let record = match record {
                Some(record) => record,
                None => {
                    report
                        .errors
                        .push(format!("Replay stopped at missing or corrupt record {:05}", version));
                    return Ok(());
                }
            };
            let check = &mut report.records[index];

            match reconstructor.apply_record(scratch.path(), *version, record) {
                Ok(()) => {
                    check.before_digest_valid = Some(true);
                    check.after_digest_valid = Some(true);
                    debug!("Record {:05} replayed", version);
                }
                Err(e) => {
                    match &e {
                        PatchError::DigestMismatch { stage: "before", .. } => {
                            check.before_digest_valid = Some(false);
                        }
                        PatchError::DigestMismatch { .. } => {
                            check.before_digest_valid = Some(true);
                            check.after_digest_valid = Some(false);
                        }
                        _ => check.before_digest_valid = Some(true),
                    }
                    check.error.get_or_insert_with(|| e.to_string());
                    report
                        .errors
                        .push(format!("Replay stopped at record {:05}: {}", version, e));
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Verification result for one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordVerification {
    /// Version of the record
    pub version: u32,
    /// Whether the record exists, parses and matches its `Patch:` digest
    pub patch_digest_valid: bool,
    /// Whether the tree matched `Before:` during replay (`None` if not replayed)
    pub before_digest_valid: Option<bool>,
    /// Whether the tree matched `After:` during replay (`None` if not reached)
    pub after_digest_valid: Option<bool>,
    /// Whether the record is the chain head, a snapshot of the empty tree
    pub is_snapshot: bool,
    /// First problem found
    pub error: Option<String>,
}

impl RecordVerification {
    fn new(version: u32) -> Self {
        Self {
            version,
            patch_digest_valid: false,
            before_digest_valid: None,
            after_digest_valid: None,
            is_snapshot: false,
            error: None,
        }
    }

    /// Check if the record passed every check
    pub fn is_valid(&self) -> bool {
        self.patch_digest_valid
            && self.before_digest_valid == Some(true)
            && self.after_digest_valid == Some(true)
            && self.error.is_none()
    }
}

/// Result of verifying a whole chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerificationReport {
    /// Head version at the time of verification
    pub latest: u32,
    /// Per-record results, ascending by version
    pub records: Vec<RecordVerification>,
    /// Chain-level problems
    pub errors: Vec<String>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl ChainVerificationReport {
    fn new(latest: u32) -> Self {
        Self {
            latest,
            records: Vec::new(),
            errors: Vec::new(),
            verification_time_ms: 0,
        }
    }

    /// Check if the chain is fully valid
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.records.iter().all(RecordVerification::is_valid)
    }

    /// Records that failed any check
    pub fn invalid_records(&self) -> impl Iterator<Item = &RecordVerification> {
        self.records.iter().filter(|r| !r.is_valid())
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Chain is valid: {} records verified in {}ms",
                self.records.len(),
                self.verification_time_ms
            )
        } else {
            let bad: Vec<String> = self
                .invalid_records()
                .map(|r| format!("{:05}", r.version))
                .collect();
            format!(
                "Chain has issues: {}/{} records valid (bad: {}), {} errors in {}ms",
                self.records.len() - bad.len(),
                self.records.len(),
                bad.join(", "),
                self.errors.len(),
                self.verification_time_ms
            )
        }
    }
}
