//! Property-based testing for Respatch
//!
//! Uses proptest to check the chain invariants across randomly generated
//! template histories: every committed version reproduces exactly, and a
//! migrated untouched tree equals a fresh deploy.

use ::respatch::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// One template state: logical path to content
type Tree = BTreeMap<String, String>;

/// Small line alphabet so repeated lines and ambiguous hunks are common
fn content_strategy() -> impl Strategy<Value = String> {
    (
        prop::collection::vec("[a-c]{0,3}", 0..12),
        any::<bool>(),
    )
        .prop_map(|(lines, trailing_newline)| {
            let mut text = lines.join("\n");
            if trailing_newline && !text.is_empty() {
                text.push('\n');
            }
            text
        })
}

fn path_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-d]\\.txt",
        "sub/[a-c]\\.txt",
        "sub/deep/[a-b]\\.md",
    ]
}

fn tree_strategy() -> impl Strategy<Value = Tree> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..6)
}

/// Replace the contents of `root` with `tree`
fn materialize(root: &Path, tree: &Tree) {
    if root.exists() {
        fs::remove_dir_all(root).unwrap();
    }
    fs::create_dir_all(root).unwrap();
    for (logical, content) in tree {
        let path = root.join(logical);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Commit every tree in order, returning version -> tree digest
fn build_chain(temp_dir: &TempDir, respatch: &mut Respatch, history: &[Tree]) -> BTreeMap<u32, String> {
    let template = temp_dir.path().join("template");
    let mut committed = BTreeMap::new();
    for tree in history {
        materialize(&template, tree);
        if let Some(version) = respatch.commit(&template).unwrap() {
            committed.insert(version, digest_tree(Some(&template)).unwrap());
        }
    }
    committed
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every committed version deploys to exactly the committed tree
    #[test]
    fn every_version_reproduces(history in prop::collection::vec(tree_strategy(), 1..6)) {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let committed = build_chain(&temp_dir, &mut respatch, &history);

        for (version, expected) in &committed {
            let target = temp_dir.path().join(format!("deploy_{}", version));
            let result = respatch.deploy(&target, VersionSpec::Exact(*version)).unwrap();
            prop_assert_eq!(&result.tree_digest, expected);
        }

        // Only the head is a snapshot, and the chain links up
        let latest = respatch.latest_version();
        let report = respatch.verify().unwrap();
        prop_assert!(report.is_valid(), "{}", report.summary());
        for check in &report.records {
            prop_assert_eq!(check.is_snapshot, check.version == latest);
        }
        for version in 1..=latest {
            let record = respatch.record(version).unwrap();
            if version == latest {
                prop_assert!(record.starts_from_empty());
            }
            if version < latest {
                let above = respatch.record(version + 1).unwrap();
                prop_assert_eq!(&record.before_digest, &above.after_digest);
            }
        }
    }

    /// Migrating an untouched deployment lands on the target version
    #[test]
    fn untouched_migration_matches_deploy(
        history in prop::collection::vec(tree_strategy(), 2..5),
        from_pick in any::<prop::sample::Index>(),
    ) {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let committed = build_chain(&temp_dir, &mut respatch, &history);
        let latest = respatch.latest_version();
        prop_assume!(latest >= 1);

        let from = from_pick.index(latest as usize) as u32 + 1;
        let project = temp_dir.path().join("project");
        respatch.deploy(&project, VersionSpec::Exact(from)).unwrap();

        let result = respatch
            .migrate(&project, from, VersionSpec::Latest, None, ApplyMode::Batch)
            .unwrap();
        prop_assert!(!result.has_conflicts());
        prop_assert_eq!(&digest_tree(Some(&project)).unwrap(), &committed[&latest]);
    }

    /// A patch produced by the builtin codec turns old content into new
    #[test]
    fn builtin_patch_applies(old in content_strategy(), new in content_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let codec = BuiltinCodec::default();
        let old_path = temp_dir.path().join("old.txt");
        let new_path = temp_dir.path().join("new.txt");
        fs::write(&old_path, &old).unwrap();
        fs::write(&new_path, &new).unwrap();

        let body = create_patch(&codec, "f.txt", Some(&old_path), Some(&new_path)).unwrap();
        prop_assert_eq!(body.is_none(), old == new);

        let target = temp_dir.path().join("target");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("f.txt"), &old).unwrap();
        if let Some(body) = body {
            apply_patch(&codec, &target, &body, ApplyMode::Batch).unwrap();
        }
        prop_assert_eq!(fs::read_to_string(target.join("f.txt")).unwrap(), new);
    }

    /// Tree digests ignore where the tree lives and how it was written
    #[test]
    fn tree_digest_is_location_independent(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("first");
        let second = temp_dir.path().join("elsewhere/second");
        materialize(&first, &tree);
        materialize(&second, &tree);

        let digest = digest_tree(Some(&first)).unwrap();
        prop_assert_eq!(&digest, &digest_tree(Some(&second)).unwrap());
        prop_assert_eq!(tree.is_empty(), digest == EMPTY_TREE_DIGEST);
    }
}
