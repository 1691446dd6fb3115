//! Main Respatch API implementation
//!
//! [`Respatch`] ties the store, the configured codec and the tree scanner
//! together and is what collaborators call. The patch directory is scanned
//! once when the instance is opened; commits made through the instance keep
//! the in-memory index current.

use crate::chain::ChainBuilder;
use crate::codec::{self, PatchCodec};
use crate::digest::TreeScanner;
use crate::error::Result;
use crate::migrate::MigrationReconciler;
use crate::reconstruct::{Reconstructor, SnapshotSet};
use crate::record::PatchRecord;
use crate::store::PatchStore;
use crate::types::{
    ApplyMode, CodecKind, DeployResult, MigrationResult, RespatchConfig, VersionSpec,
};
use crate::verification::{ChainVerificationReport, ChainVerifier};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// A patch chain opened for reading and committing
///
/// # Examples
///
/// ```rust,no_run
/// use respatch::{ApplyMode, Respatch, VersionSpec};
/// use std::path::Path;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut respatch = Respatch::open("patches")?;
///
/// // Maintainer side: record the template tree as the next version
/// if let Some(version) = respatch.commit(Path::new("template"))? {
///     println!("committed version {}", version);
/// }
///
/// // Client side: upgrade a project that was generated at version 1
/// let result = respatch.migrate(Path::new("my_app"), 1, VersionSpec::Latest, None, ApplyMode::Merge)?;
/// if result.has_conflicts() {
///     println!("resolve conflicts in {:?}", result.outcome.conflicts);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Respatch {
    store: PatchStore,
    codec: Box<dyn PatchCodec>,
    scanner: TreeScanner,
    config: RespatchConfig,
}

impl Respatch {
    /// Open the chain in `patch_dir` with default configuration
    ///
    /// The directory is created if missing. `RESPATCH_DIFF` and
    /// `RESPATCH_PATCH` are honored.
    pub fn open(patch_dir: impl Into<PathBuf>) -> Result<Self> {
        RespatchBuilder::new().build(patch_dir)
    }

    /// Directory holding the patch records
    pub fn patch_dir(&self) -> &Path {
        self.store.dir()
    }

    /// Effective configuration
    pub fn config(&self) -> &RespatchConfig {
        &self.config
    }

    /// Codec in use
    pub fn codec(&self) -> &dyn PatchCodec {
        self.codec.as_ref()
    }

    /// Highest committed version, 0 for an empty chain
    pub fn latest_version(&self) -> u32 {
        self.store.latest()
    }

    /// Turn `latest` or a number into a version in `[0, latest]`
    pub fn resolve_version(&self, spec: VersionSpec) -> Result<u32> {
        self.store.resolve(spec, 0)
    }

    /// Re-scan the patch directory
    pub fn refresh(&mut self) -> Result<()> {
        self.store.refresh()
    }

    /// Commit `to` as the next version
    ///
    /// The current head is reconstructed in scratch space and used as the
    /// source tree. Returns `None` when `to` is identical to the head.
    #[instrument(skip(self))]
    pub fn commit(&mut self, to: &Path) -> Result<Option<u32>> {
        let latest = self.store.latest();
        if latest == 0 {
            return self.commit_from(None, to);
        }

        let scratch = tempfile::Builder::new().prefix("respatch-head-").tempdir()?;
        let head = scratch.path().join("head");
        Reconstructor::new(&self.store, self.codec.as_ref()).deploy(&head, latest)?;
        debug!("Reconstructed head {} at {:?}", latest, head);
        self.commit_from(Some(&head), to)
    }

    /// Commit `to` as the next version, given that `from` is the current head
    ///
    /// # Errors
    ///
    /// [`crate::PatchError::ChainMismatch`] when `from` does not reproduce the
    /// head's `After:` digest.
    #[instrument(skip(self))]
    pub fn commit_from(&mut self, from: Option<&Path>, to: &Path) -> Result<Option<u32>> {
        let version = ChainBuilder::new(&mut self.store, self.codec.as_ref(), &self.scanner).create(from, to)?;
        match version {
            Some(v) => info!("Created version {} from {:?}", v, to),
            None => info!("No changes in {:?}", to),
        }
        Ok(version)
    }

    /// Materialize `version` into the empty (or missing) directory `target`
    #[instrument(skip(self))]
    pub fn deploy(&self, target: &Path, version: VersionSpec) -> Result<DeployResult> {
        let version = self.resolve_version(version)?;
        Reconstructor::new(&self.store, self.codec.as_ref()).deploy(target, version)
    }

    /// Snapshot every version in `from..=to` into scratch space
    #[instrument(skip(self))]
    pub fn reconstruct_range(&self, from: u32, to: u32) -> Result<SnapshotSet> {
        Reconstructor::new(&self.store, self.codec.as_ref()).reconstruct_range(from, to)
    }

    /// Upgrade the deployed tree at `deployed` from `from` to `to`
    ///
    /// See [`MigrationReconciler::migrate`].
    #[instrument(skip(self, files))]
    pub fn migrate(
        &self,
        deployed: &Path,
        from: u32,
        to: VersionSpec,
        files: Option<&[String]>,
        mode: ApplyMode,
    ) -> Result<MigrationResult> {
        let to = self.resolve_version(to)?;
        MigrationReconciler::new(&self.store, self.codec.as_ref()).migrate(deployed, from, to, files, mode)
    }

    /// Check every record and replay the whole chain
    #[instrument(skip(self))]
    pub fn verify(&self) -> Result<ChainVerificationReport> {
        ChainVerifier::new(&self.store, self.codec.as_ref()).verify()
    }

    /// Read one record (digest-checked)
    pub fn record(&self, version: u32) -> Result<PatchRecord> {
        self.store.read(version)
    }

    /// Recompute the body digest of a hand-edited record
    #[instrument(skip(self))]
    pub fn reseal(&mut self, version: u32) -> Result<bool> {
        self.store.reseal(version)
    }
}

/// Builder for configuring a [`Respatch`] instance
///
/// Values set on the builder win over the environment, which wins over the
/// configuration file, which wins over the defaults.
///
/// # Examples
///
/// ```rust,no_run
/// use respatch::{CodecKind, RespatchBuilder};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let respatch = RespatchBuilder::new()
///     .codec(CodecKind::External)
///     .context_lines(5)
///     .ignore_patterns(vec!["*.log".to_string(), "tmp/".to_string()])
///     .build("patches")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct RespatchBuilder {
    base: Option<RespatchConfig>,
    config_file: Option<PathBuf>,
    codec: Option<CodecKind>,
    diff_program: Option<PathBuf>,
    patch_program: Option<PathBuf>,
    context_lines: Option<usize>,
    max_fuzz: Option<usize>,
    ignore_patterns: Option<Vec<String>>,
}

impl RespatchBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an explicit configuration instead of the defaults
    pub fn config(mut self, config: RespatchConfig) -> Self {
        self.base = Some(config);
        self
    }

    /// Load the base configuration from a JSON file at build time
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Select the codec
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.codec = Some(codec);
        self
    }

    /// `diff` executable for the external codec
    pub fn diff_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.diff_program = Some(program.into());
        self
    }

    /// `patch` executable for the external codec
    pub fn patch_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.patch_program = Some(program.into());
        self
    }

    /// Context lines around each hunk
    pub fn context_lines(mut self, lines: usize) -> Self {
        self.context_lines = Some(lines);
        self
    }

    /// Context lines the builtin applier may ignore at each end of a hunk
    pub fn max_fuzz(mut self, fuzz: usize) -> Self {
        self.max_fuzz = Some(fuzz);
        self
    }

    /// Glob patterns excluded from committed trees
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.ignore_patterns = Some(patterns);
        self
    }

    /// Resolve the effective configuration
    pub fn resolve_config(&self) -> Result<RespatchConfig> {
        let mut config = match (&self.base, &self.config_file) {
            (Some(base), _) => base.clone(),
            (None, Some(path)) => RespatchConfig::load(path)?,
            (None, None) => RespatchConfig::default(),
        }
        .apply_env();

        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if let Some(program) = &self.diff_program {
            config.diff_program = program.clone();
        }
        if let Some(program) = &self.patch_program {
            config.patch_program = program.clone();
        }
        if let Some(lines) = self.context_lines {
            config.context_lines = lines;
        }
        if let Some(fuzz) = self.max_fuzz {
            config.max_fuzz = fuzz;
        }
        if let Some(patterns) = &self.ignore_patterns {
            config.ignore_patterns = patterns.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Open the chain in `patch_dir`
    pub fn build(self, patch_dir: impl Into<PathBuf>) -> Result<Respatch> {
        let config = self.resolve_config()?;
        let scanner = TreeScanner::new().with_ignore_patterns(&config.ignore_patterns)?;
        let codec = codec::build_codec(&config);
        let store = PatchStore::open(patch_dir)?;
        info!(
            "Opened {:?} at version {} ({} codec)",
            store.dir(),
            store.latest(),
            codec.name()
        );

        Ok(Respatch {
            store,
            codec,
            scanner,
            config,
        })
    }
}
