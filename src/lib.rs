//! # Respatch - Reverse-delta patch chains for directory trees
//!
//! Respatch keeps every historical version of a managed directory tree as a
//! chain of numbered, digest-verified unified diffs, and upgrades deployed,
//! possibly hand-edited copies of that tree from one version to another.
//!
//! ## Overview
//!
//! - **Commit** a tree as the next version. Only the newest record holds a
//!   full snapshot; every older record is a backward delta to its successor.
//! - **Deploy** any version into an empty directory by replaying the chain
//!   from the head down, checking tree digests before and after every step.
//! - **Migrate** a deployed tree: for each file, find the newest version the
//!   deployed copy still matches, then patch it straight to the target. Local
//!   edits survive, and in merge mode unplaceable hunks become inline conflict
//!   markers instead of failures.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use respatch::{ApplyMode, Respatch, VersionSpec};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut respatch = Respatch::open("patches")?;
//!
//! // Record two versions of a template tree
//! respatch.commit(Path::new("template"))?;
//! // ... edit template/ ...
//! respatch.commit(Path::new("template"))?;
//!
//! // Fresh install of version 1
//! respatch.deploy(Path::new("my_app"), VersionSpec::Exact(1))?;
//!
//! // Later: bring it up to date, keeping local edits
//! let result = respatch.migrate(Path::new("my_app"), 1, VersionSpec::Latest, None, ApplyMode::Merge)?;
//! println!("{} files patched", result.patched_files().count());
//! # Ok(())
//! # }
//! ```
//!
//! ## On-disk Format
//!
//! A patch directory is a flat list of `NNNNN.patch` files. Each starts with
//! three header lines followed by the diff body:
//!
//! ```text
//! Before: <digest of the tree this record applies to>
//! After: <digest of the tree it produces>
//! Patch: <digest of the body below>
//! --- /dev/null
//! +++ config/app.yml
//! @@ -0,0 +1,1 @@
//! +name: demo
//! ```
//!
//! Tree digests cover file contents only. Executable bits travel inside the
//! diff body as `mode` lines but are not part of any digest.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] with a [`PatchError`]. Integrity
//! failures ([`PatchError::is_corruption`]) are never retried, and
//! precondition failures ([`PatchError::is_precondition`]) are raised before
//! anything on disk changes.
//!
//! ## Module Organization
//!
//! - [`digest`]: file and tree fingerprints
//! - [`diff`] and [`apply`]: the unified diff model and the builtin applier
//! - [`codec`]: the Patch Codec trait, builtin and external implementations
//! - [`record`] and [`store`]: the record format and the patch directory
//! - [`chain`], [`reconstruct`], [`migrate`]: building, replaying and
//!   reconciling the chain
//! - [`verification`]: whole-chain checks
//! - [`types`] and [`error`]: shared types

// Public API modules
pub mod apply;
pub mod chain;
pub mod codec;
pub mod diff;
pub mod digest;
pub mod error;
pub mod migrate;
pub mod reconstruct;
pub mod record;
pub mod respatch;
pub mod store;
pub mod types;
pub mod verification;

// Internal modules (not part of public API)
mod utils;

// Re-export main types for convenience
pub use codec::{apply_patch, create_patch, BuiltinCodec, ExternalCodec, PatchCodec};
pub use digest::{digest, digest_file, digest_tree, EMPTY_TREE_DIGEST};
pub use error::{PatchError, Result};
pub use reconstruct::SnapshotSet;
pub use record::PatchRecord;
pub use respatch::{Respatch, RespatchBuilder};
pub use store::{latest_version, parse_version, PatchStore};
pub use types::*;
pub use verification::{ChainVerificationReport, RecordVerification};
