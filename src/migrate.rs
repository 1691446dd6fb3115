//! Migration Reconciler
//!
//! Upgrades a deployed, possibly hand-edited tree from version `from` to
//! version `to` without a merge algorithm of its own:
//!
//! 1. every version in `from..=to` is reconstructed in scratch space,
//! 2. for each tracked file, the *match point* is the highest version whose
//!    copy of the file is byte-identical to the deployed one (`from` when
//!    nothing matches, meaning the file was edited locally),
//! 3. one patch per file is built from the match point straight to `to`,
//! 4. all patches are applied to the deployed tree in a single batch.
//!
//! A file the client never touched is therefore moved in one hop, and a file
//! the client edited receives only the upstream changes, placed by the
//! codec's context matching on top of the local edits.
//!
//! Nothing touches the deployed tree before step 4, so an integrity failure
//! during reconstruction leaves it exactly as it was.

use crate::codec::{self, PatchCodec};
use crate::diff::PatchSet;
use crate::digest;
use crate::error::{PatchError, Result};
use crate::reconstruct::{Reconstructor, SnapshotSet};
use crate::store::PatchStore;
use crate::types::{
    ApplyMode, ApplyOutcome, ApplyStatus, FileAction, FileMigration, MigrationResult,
    MigrationState,
};
use crate::utils;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Reconciles a deployed tree with a newer chain version
#[derive(Debug)]
pub struct MigrationReconciler<'a> {
    store: &'a PatchStore,
    codec: &'a dyn PatchCodec,
}

impl<'a> MigrationReconciler<'a> {
    /// Create a reconciler over `store`
    pub fn new(store: &'a PatchStore, codec: &'a dyn PatchCodec) -> Self {
        Self { store, codec }
    }

    /// Migrate `deployed` from version `from` to version `to`
    ///
    /// # Arguments
    ///
    /// * `deployed` - The live tree, modified in place
    /// * `from` - Version the tree was deployed (or last migrated) at
    /// * `to` - Version to move to
    /// * `files` - Files to reconcile; `None` tracks every file that exists
    ///   in any version of the range
    /// * `mode` - [`ApplyMode::Merge`] turns unplaceable hunks into conflict
    ///   markers instead of failing
    ///
    /// # Errors
    ///
    /// Precondition errors for an inverted or out-of-range version pair or an
    /// invalid tracked path, integrity errors from reconstruction, and in
    /// batch mode [`PatchError::HunkRejected`] (the tree is then unchanged).
    pub fn migrate(
        &self,
        deployed: &Path,
        from: u32,
        to: u32,
        files: Option<&[String]>,
        mode: ApplyMode,
    ) -> Result<MigrationResult> {
        let start = Instant::now();
        if to < from {
            return Err(PatchError::InvalidRange { from, to });
        }
        self.store.validate_version(to, 0)?;
        if let Some(files) = files {
            for file in files {
                utils::validate_logical_path(file)?;
            }
        }

        let mut state = MigrationState::NotStarted;
        if from == to {
            info!("Already at version {}; nothing to migrate", to);
            advance(&mut state, MigrationState::Applied(ApplyStatus::Clean))?;
            return Ok(MigrationResult {
                from_version: from,
                to_version: to,
                state,
                files: Vec::new(),
                outcome: ApplyOutcome::default(),
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        let snapshots = Reconstructor::new(self.store, self.codec).reconstruct_range(from, to)?;
        advance(&mut state, MigrationState::VersionsReconstructed)?;

        let tracked: Vec<String> = match files {
            Some(files) => files.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect(),
            None => snapshots.all_files()?,
        };

        let mut sections = Vec::new();
        let mut reports = Vec::with_capacity(tracked.len());
        for logical in &tracked {
            let deployed_path = utils::resolve_logical(deployed, logical)?;
            let deployed_digest = if deployed_path.is_file() {
                Some(digest::digest_file(&deployed_path)?)
            } else {
                None
            };

            let (match_point, matched) =
                find_match_point(&snapshots, logical, deployed_digest.as_deref(), from, to)?;
            debug!(
                "{}: match point {}{}",
                logical,
                match_point,
                if matched { "" } else { " (defaulted, locally modified)" }
            );

            let action = if match_point == to {
                FileAction::UpToDate
            } else if deployed_digest.is_none() && !matched {
                warn!("{} was removed locally; leaving it absent", logical);
                FileAction::LocallyRemoved
            } else {
                let base = snapshots.file(match_point, logical)?;
                let target = snapshots.file(to, logical)?;
                match codec::create_section(self.codec, logical, base.as_deref(), target.as_deref())? {
                    Some(section) => {
                        sections.push(section);
                        FileAction::Patched
                    }
                    None => FileAction::NoUpstreamChange,
                }
            };

            reports.push(FileMigration {
                path: logical.clone(),
                match_point,
                matched,
                action,
            });
        }
        advance(&mut state, MigrationState::PatchesBuilt)?;

        let outcome = if sections.is_empty() {
            ApplyOutcome::default()
        } else {
            let body = PatchSet { files: sections }.render();
            codec::apply_patch(self.codec, deployed, &body, mode)?
        };

        for report in &mut reports {
            if outcome.conflicts.iter().any(|c| *c == report.path) {
                report.action = FileAction::Conflicted;
            }
        }

        let status = if outcome.has_conflicts() {
            ApplyStatus::WithConflicts
        } else {
            ApplyStatus::Clean
        };
        advance(&mut state, MigrationState::Applied(status))?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if outcome.has_conflicts() {
            warn!(
                "Migrated {:?} from {} to {} with conflicts in {} files",
                deployed,
                from,
                to,
                outcome.conflicts.len()
            );
        } else {
            info!(
                "Migrated {:?} from {} to {} ({} files patched) in {}ms",
                deployed,
                from,
                to,
                outcome.files_touched(),
                duration_ms
            );
        }

        Ok(MigrationResult {
            from_version: from,
            to_version: to,
            state,
            files: reports,
            outcome,
            duration_ms,
        })
    }
}

fn advance(state: &mut MigrationState, next: MigrationState) -> Result<()> {
    if !state.can_advance_to(next) {
        return Err(PatchError::internal(format!(
            "illegal migration step {:?} -> {:?}",
            state, next
        )));
    }
    *state = next;
    Ok(())
}

/// Highest version in `from..=to` whose copy of `logical` matches the deployed one
///
/// An absent deployed file matches versions that lack the file too. Returns
/// `(from, false)` when nothing matches.
fn find_match_point(
    snapshots: &SnapshotSet,
    logical: &str,
    deployed_digest: Option<&str>,
    from: u32,
    to: u32,
) -> Result<(u32, bool)> {
    for version in (from..=to).rev() {
        let snapshot_digest = snapshots
            .file(version, logical)?
            .map(|path| digest::digest_file(&path))
            .transpose()?;
        if snapshot_digest.as_deref() == deployed_digest {
            return Ok((version, true));
        }
    }
    Ok((from, false))
}
