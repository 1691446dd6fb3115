//! Integration tests for Respatch
//!
//! Exercise whole chains the way a scaffolding tool drives them: a template
//! evolves through many commits, projects are generated from old versions,
//! edited by hand, and later migrated forward.

use ::respatch::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::info;

/// Test harness holding a template tree and its patch chain
pub struct ChainTestHarness {
    pub temp_dir: TempDir,
    pub template: PathBuf,
    pub respatch: Respatch,
    pub file_generator: FileGenerator,
    /// Tree digest of every committed version
    pub committed: BTreeMap<u32, String>,
}

impl ChainTestHarness {
    /// Create a harness using the builtin codec
    pub fn new() -> Self {
        Self::with_builder(RespatchBuilder::new())
    }

    /// Create a harness from a configured builder
    pub fn with_builder(builder: RespatchBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let template = temp_dir.path().join("template");
        fs::create_dir_all(&template).unwrap();
        let respatch = builder.build(temp_dir.path().join("patches")).unwrap();

        Self {
            temp_dir,
            template,
            respatch,
            file_generator: FileGenerator::new(42),
            committed: BTreeMap::new(),
        }
    }

    /// Write a template file, creating parent directories
    pub fn write(&self, logical: &str, content: &str) {
        let path = self.template.join(logical);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Remove a template file
    pub fn remove(&self, logical: &str) {
        fs::remove_file(self.template.join(logical)).unwrap();
    }

    /// Commit the template, remembering its digest
    pub fn commit(&mut self) -> Option<u32> {
        let version = self.respatch.commit(&self.template).unwrap();
        if let Some(v) = version {
            self.committed.insert(v, digest_tree(Some(&self.template)).unwrap());
        }
        version
    }

    /// Deploy `version` into a fresh directory named `name`
    pub fn deploy(&self, version: u32, name: &str) -> PathBuf {
        let target = self.temp_dir.path().join(name);
        self.respatch.deploy(&target, VersionSpec::Exact(version)).unwrap();
        target
    }

    /// Rewrite text in a record's body by hand, then reseal its digest
    pub fn corrupt_record(&mut self, version: u32, from: &str, to: &str) -> anyhow::Result<()> {
        let path = self.respatch.patch_dir().join(format!("{:05}.patch", version));
        let text = fs::read_to_string(&path)?;
        anyhow::ensure!(text.contains(from), "record {} has no {:?}", version, from);
        fs::write(&path, text.replace(from, to))?;
        anyhow::ensure!(self.respatch.reseal(version)?, "record {} was not resealed", version);
        Ok(())
    }

    /// Generate a project of text files
    pub fn generate_project(&mut self, config: ProjectConfig) {
        for dir in 0..config.dirs {
            for file in 0..config.files_per_dir {
                let logical = format!("dir_{}/file_{}.txt", dir, file);
                let content = self.file_generator.text(config.lines.clone());
                self.write(&logical, &content);
            }
        }
    }

    /// Randomly edit, add and remove template files
    pub fn mutate(&mut self, mutations: usize) {
        let files = tracked(&self.template);
        for _ in 0..mutations {
            let roll = self.file_generator.rng.random_range(0..10);
            if roll < 7 && !files.is_empty() {
                let logical = &files[self.file_generator.rng.random_range(0..files.len())];
                let path = self.template.join(logical);
                if path.exists() {
                    let edited = self
                        .file_generator
                        .edit(&fs::read_to_string(&path).unwrap());
                    fs::write(path, edited).unwrap();
                }
            } else if roll < 9 {
                let n = self.file_generator.rng.random_range(0..1000);
                let content = self.file_generator.text(1..20);
                self.write(&format!("added/new_{}.txt", n), &content);
            } else if !files.is_empty() {
                let logical = &files[self.file_generator.rng.random_range(0..files.len())];
                let _ = fs::remove_file(self.template.join(logical));
            }
        }
    }
}

/// Deterministic text content generator
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A few lines of text, always newline-terminated
    pub fn text(&mut self, lines: std::ops::Range<usize>) -> String {
        let count = self.rng.random_range(lines);
        (0..count)
            .map(|_| format!("line {}\n", self.rng.random_range(0..10_000)))
            .collect()
    }

    /// Replace, insert or drop one line
    pub fn edit(&mut self, text: &str) -> String {
        let mut lines: Vec<String> = text.lines().map(|l| format!("{}\n", l)).collect();
        let replacement = format!("edited {}\n", self.rng.random_range(0..10_000));
        if lines.is_empty() {
            return replacement;
        }
        let at = self.rng.random_range(0..lines.len());
        match self.rng.random_range(0..3) {
            0 => lines[at] = replacement,
            1 => lines.insert(at, replacement),
            _ => {
                lines.remove(at);
            }
        }
        lines.concat()
    }
}

/// Shape of a generated project
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub dirs: usize,
    pub files_per_dir: usize,
    pub lines: std::ops::Range<usize>,
}

/// Every regular file under `root`, as sorted logical paths
pub fn tracked(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

/// Whether `diff` and `patch` can be spawned
pub fn external_tools_available() -> bool {
    ["diff", "patch"].iter().all(|program| {
        Command::new(program)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const TWENTY_LINES: &str = "line 1\nline 2\nline 3\nline 4\nline 5\nline 6\nline 7\nline 8\nline 9\nline 10\n\
line 11\nline 12\nline 13\nline 14\nline 15\nline 16\nline 17\nline 18\nline 19\nline 20\n";

    #[test]
    #[traced_test]
    fn test_every_version_round_trips() {
        let mut harness = ChainTestHarness::new();
        harness.generate_project(ProjectConfig {
            dirs: 3,
            files_per_dir: 4,
            lines: 5..40,
        });
        harness.commit().unwrap();

        for _ in 0..8 {
            harness.mutate(6);
            harness.commit();
        }
        info!("Committed {} versions", harness.committed.len());

        for (version, expected) in harness.committed.clone() {
            let target = harness.deploy(version, &format!("deploy_{}", version));
            assert_eq!(
                digest_tree(Some(&target)).unwrap(),
                expected,
                "version {} did not reproduce",
                version
            );
        }

        let report = harness.respatch.verify().unwrap();
        assert!(report.is_valid(), "{}", report.summary());
    }

    #[test]
    fn test_only_head_is_snapshot() {
        let mut harness = ChainTestHarness::new();
        for i in 1..=4 {
            harness.write("config.yml", &format!("revision: {}\n", i));
            assert_eq!(harness.commit(), Some(i));
        }

        for version in 1..=4 {
            let record = harness.respatch.record(version).unwrap();
            assert_eq!(record.starts_from_empty(), version == 4, "version {}", version);
            assert_eq!(record.after_digest, harness.committed[&version]);
        }

        // Each older record links to the one above it
        for version in 1..4 {
            let record = harness.respatch.record(version).unwrap();
            let above = harness.respatch.record(version + 1).unwrap();
            assert_eq!(record.before_digest, above.after_digest);
        }
    }

    #[test]
    fn test_noop_commit_creates_nothing() {
        let mut harness = ChainTestHarness::new();
        harness.write("a.txt", "a\n");
        assert_eq!(harness.commit(), Some(1));
        assert_eq!(harness.commit(), None);
        assert_eq!(harness.respatch.latest_version(), 1);
        assert!(!harness.respatch.patch_dir().join("00002.patch").exists());
    }

    #[test]
    fn test_commit_from_stale_tree_rejected() {
        let mut harness = ChainTestHarness::new();
        harness.write("a.txt", "1\n");
        harness.commit();
        harness.write("a.txt", "2\n");
        harness.commit();

        let stale = harness.deploy(1, "stale");
        let next = harness.temp_dir.path().join("next");
        fs::create_dir_all(&next).unwrap();
        fs::write(next.join("a.txt"), "3\n").unwrap();

        let err = harness.respatch.commit_from(Some(&stale), &next).unwrap_err();
        assert!(matches!(err, PatchError::ChainMismatch { version: 2, .. }), "{}", err);
        assert_eq!(harness.respatch.latest_version(), 2);
    }

    /// A exists from v1 on, B changes at v2, C (executable) arrives at v3
    #[test]
    #[traced_test]
    fn test_three_version_scenario() {
        let mut harness = ChainTestHarness::new();
        harness.write("A", "alpha\n");
        harness.write("B", "bravo 1\n");
        harness.commit();
        harness.write("B", "bravo 2\n");
        harness.commit();
        harness.write("C", "#!/bin/sh\necho charlie\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(harness.template.join("C"), fs::Permissions::from_mode(0o755)).unwrap();
        }
        harness.commit();

        let v2 = harness.deploy(2, "v2");
        assert_eq!(tracked(&v2), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(fs::read_to_string(v2.join("B")).unwrap(), "bravo 2\n");

        let v3 = harness.deploy(3, "v3");
        let project = harness.deploy(1, "project");
        let files: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let result = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Exact(3), Some(&files), ApplyMode::Batch)
            .unwrap();

        assert_eq!(result.state, MigrationState::Applied(ApplyStatus::Clean));
        assert_eq!(digest_tree(Some(&project)).unwrap(), digest_tree(Some(&v3)).unwrap());
        assert_eq!(result.outcome.files_created, vec!["C".to_string()]);

        let actions: BTreeMap<&str, FileAction> =
            result.files.iter().map(|f| (f.path.as_str(), f.action)).collect();
        assert_eq!(actions["A"], FileAction::UpToDate);
        assert_eq!(actions["B"], FileAction::Patched);
        assert_eq!(actions["C"], FileAction::Patched);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            for tree in [&v3, &project] {
                let mode = fs::metadata(tree.join("C")).unwrap().permissions().mode();
                assert_ne!(mode & 0o111, 0, "C is not executable in {:?}", tree);
            }
        }
    }

    #[test]
    fn test_local_edits_survive_migration() {
        let mut harness = ChainTestHarness::new();
        harness.write("notes.txt", TWENTY_LINES);
        harness.write("other.txt", "untouched\n");
        harness.commit();
        harness.write("notes.txt", &TWENTY_LINES.replace("line 18\n", "line 18 upstream\n"));
        harness.commit();

        let project = harness.deploy(1, "project");
        let local = TWENTY_LINES.replace("line 2\n", "line 2 local\n");
        fs::write(project.join("notes.txt"), &local).unwrap();

        let result = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap();
        assert!(!result.has_conflicts());

        let notes = fs::read_to_string(project.join("notes.txt")).unwrap();
        assert!(notes.contains("line 2 local\n"));
        assert!(notes.contains("line 18 upstream\n"));
        assert!(!notes.contains("line 18\n"));

        let notes_report = result.files.iter().find(|f| f.path == "notes.txt").unwrap();
        assert_eq!(notes_report.match_point, 1);
        assert!(!notes_report.matched);
        assert_eq!(notes_report.action, FileAction::Patched);
    }

    #[test]
    fn test_match_point_skips_versions() {
        let mut harness = ChainTestHarness::new();
        harness.write("f.txt", "v1\n");
        harness.commit();
        harness.write("f.txt", "v2\n");
        harness.commit();
        harness.write("g.txt", "g\n");
        harness.commit();
        harness.write("f.txt", "v4\n");
        harness.commit();

        // Project said it was at 1, but f.txt was already hand-upgraded to v2
        let project = harness.deploy(1, "project");
        fs::write(project.join("f.txt"), "v2\n").unwrap();

        let result = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap();
        let f = result.files.iter().find(|f| f.path == "f.txt").unwrap();
        assert!(f.matched);
        assert_eq!(f.match_point, 3);
        assert_eq!(fs::read_to_string(project.join("f.txt")).unwrap(), "v4\n");
        assert_eq!(fs::read_to_string(project.join("g.txt")).unwrap(), "g\n");
    }

    #[test]
    #[traced_test]
    fn test_conflicts_batch_vs_merge() {
        let mut harness = ChainTestHarness::new();
        harness.write("notes.txt", TWENTY_LINES);
        harness.commit();
        harness.write("notes.txt", &TWENTY_LINES.replace("line 10\n", "line 10 upstream\n"));
        harness.commit();

        let project = harness.deploy(1, "project");
        let local = TWENTY_LINES.replace("line 10\n", "line 10 local\n");
        fs::write(project.join("notes.txt"), &local).unwrap();

        // Batch mode fails and leaves the tree alone
        let err = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap_err();
        assert!(matches!(err, PatchError::HunkRejected { .. }), "{}", err);
        assert_eq!(fs::read_to_string(project.join("notes.txt")).unwrap(), local);

        // Merge mode leaves markers and reports the file
        let result = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Merge)
            .unwrap();
        assert!(result.has_conflicts());
        assert_eq!(result.state, MigrationState::Applied(ApplyStatus::WithConflicts));
        assert_eq!(result.outcome.conflicts, vec!["notes.txt".to_string()]);
        assert_eq!(result.files[0].action, FileAction::Conflicted);

        let merged = fs::read_to_string(project.join("notes.txt")).unwrap();
        assert!(merged.contains("<<<<<<<"));
        assert!(merged.contains("line 10 local\n"));
        assert!(merged.contains("line 10 upstream\n"));
        assert!(merged.contains(">>>>>>>"));
    }

    #[test]
    fn test_untouched_migration_equals_fresh_deploy() {
        let mut harness = ChainTestHarness::new();
        harness.generate_project(ProjectConfig {
            dirs: 2,
            files_per_dir: 5,
            lines: 3..30,
        });
        harness.commit().unwrap();
        for _ in 0..5 {
            harness.mutate(5);
            harness.commit();
        }
        let latest = harness.respatch.latest_version();

        for from in 1..latest {
            let project = harness.deploy(from, &format!("project_{}", from));
            let result = harness
                .respatch
                .migrate(&project, from, VersionSpec::Latest, None, ApplyMode::Batch)
                .unwrap();
            assert!(!result.has_conflicts());
            assert_eq!(
                digest_tree(Some(&project)).unwrap(),
                harness.committed[&latest],
                "migration from {} diverged",
                from
            );
        }
    }

    #[test]
    fn test_deleted_upstream_file_removed_from_project() {
        let mut harness = ChainTestHarness::new();
        harness.write("keep.txt", "keep\n");
        harness.write("old/legacy.txt", "legacy\n");
        harness.commit();
        harness.remove("old/legacy.txt");
        harness.commit();

        let project = harness.deploy(1, "project");
        let result = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap();
        assert_eq!(result.outcome.files_deleted, vec!["old/legacy.txt".to_string()]);
        assert!(!project.join("old").exists());
        assert!(project.join("keep.txt").exists());
    }

    #[test]
    fn test_tampered_body_blocks_deploy() {
        let mut harness = ChainTestHarness::new();
        harness.write("a.txt", "version 1\n");
        harness.commit();
        harness.write("a.txt", "version 2\n");
        harness.commit();

        let path = harness.respatch.patch_dir().join("00001.patch");
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("+version 1", "+version X")).unwrap();

        let target = harness.temp_dir.path().join("target");
        let err = harness
            .respatch
            .deploy(&target, VersionSpec::Exact(1))
            .unwrap_err();
        assert!(matches!(err, PatchError::PatchDigestMismatch { version: 1, .. }), "{}", err);
        assert!(err.is_corruption());
        assert!(!target.exists() || tracked(&target).is_empty());

        // Resealing fixes the body digest, but the tree digest still catches it
        assert!(harness.respatch.reseal(1).unwrap());
        let err = harness
            .respatch
            .deploy(&target, VersionSpec::Exact(1))
            .unwrap_err();
        assert!(
            matches!(err, PatchError::DigestMismatch { version: 1, stage: "after", .. }),
            "{}",
            err
        );
        assert!(tracked(&target).is_empty());

        let report = harness.respatch.verify().unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.invalid_records().map(|r| r.version).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_external_codec_round_trip() {
        if !external_tools_available() {
            eprintln!("diff/patch not installed, skipping");
            return;
        }

        let mut harness =
            ChainTestHarness::with_builder(RespatchBuilder::new().codec(CodecKind::External));
        harness.generate_project(ProjectConfig {
            dirs: 2,
            files_per_dir: 3,
            lines: 5..20,
        });
        harness.commit().unwrap();
        for _ in 0..4 {
            harness.mutate(4);
            harness.commit();
        }

        for (version, expected) in harness.committed.clone() {
            let target = harness.deploy(version, &format!("ext_{}", version));
            assert_eq!(&digest_tree(Some(&target)).unwrap(), &expected);
        }

        // Records written by one codec replay with the other
        let builtin = Respatch::open(harness.respatch.patch_dir()).unwrap();
        assert!(builtin.verify().unwrap().is_valid());
    }

    #[test]
    fn test_emptied_tree_keeps_single_snapshot() -> anyhow::Result<()> {
        let mut harness = ChainTestHarness::new();
        harness.write("a.txt", "");
        assert_eq!(harness.commit(), Some(1));
        harness.remove("a.txt");
        assert_eq!(harness.commit(), Some(2));

        // Both records start from the empty tree, but only the head is a snapshot
        assert!(harness.respatch.record(1)?.starts_from_empty());
        let report = harness.respatch.verify()?;
        assert!(report.is_valid(), "{}", report.summary());
        let shapes: Vec<(u32, bool)> = report.records.iter().map(|r| (r.version, r.is_snapshot)).collect();
        assert_eq!(shapes, vec![(1, false), (2, true)]);

        let v1 = harness.deploy(1, "v1");
        assert_eq!(tracked(&v1), vec!["a.txt".to_string()]);
        assert!(tracked(&harness.deploy(2, "v2")).is_empty());
        Ok(())
    }

    #[test]
    fn test_tmp_suffixed_files_round_trip() -> anyhow::Result<()> {
        let mut harness = ChainTestHarness::new();
        harness.write("a", "first\n");
        harness.write("a.tmp", "scratch one\n");
        harness.commit();
        harness.write("a", "second\n");
        harness.write("a.tmp", "scratch two\n");
        harness.commit();

        for version in [1, 2] {
            let target = harness.deploy(version, &format!("v{}", version));
            assert_eq!(digest_tree(Some(&target))?, harness.committed[&version]);
            assert_eq!(tracked(&target), vec!["a".to_string(), "a.tmp".to_string()]);
        }

        let project = harness.deploy(1, "project");
        harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)?;
        assert_eq!(digest_tree(Some(&project))?, harness.committed[&2]);
        Ok(())
    }

    #[test]
    fn test_untracked_tmp_file_survives_migration() -> anyhow::Result<()> {
        let mut harness = ChainTestHarness::new();
        harness.write("config", "a\n");
        harness.commit();
        harness.write("config", "b\n");
        harness.commit();

        let project = harness.deploy(1, "project");
        fs::write(project.join("config.tmp"), "mine\n")?;
        harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)?;

        assert_eq!(fs::read_to_string(project.join("config"))?, "b\n");
        assert_eq!(fs::read_to_string(project.join("config.tmp"))?, "mine\n");
        assert_eq!(tracked(&project), vec!["config".to_string(), "config.tmp".to_string()]);
        Ok(())
    }

    #[test]
    fn test_resealed_tamper_blocks_migration() -> anyhow::Result<()> {
        let mut harness = ChainTestHarness::new();
        harness.write("a.txt", "version 1\n");
        harness.write("b.txt", "stable\n");
        harness.commit();
        harness.write("a.txt", "version 2\n");
        harness.commit();
        harness.write("a.txt", "version 3\n");
        harness.commit();

        let project = harness.deploy(1, "project");
        fs::write(project.join("b.txt"), "local edit\n")?;
        let before = digest_tree(Some(&project))?;

        harness.corrupt_record(1, "+version 1", "+version X")?;
        let err = harness
            .respatch
            .migrate(&project, 1, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap_err();
        assert!(
            matches!(err, PatchError::DigestMismatch { version: 1, .. }),
            "{}",
            err
        );
        assert!(err.is_corruption());

        // Nothing in the deployed tree was touched
        assert_eq!(digest_tree(Some(&project))?, before);
        assert_eq!(tracked(&project), vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(fs::read_to_string(project.join("a.txt"))?, "version 1\n");
        Ok(())
    }
}
