//! Main test module for Respatch
//!
//! This module includes all test suites:
//! - Integration tests for whole-chain scenarios
//! - Property-based tests for invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::respatch::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_chain() {
        let temp_dir = TempDir::new().unwrap();
        let respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();

        assert_eq!(respatch.latest_version(), 0);
        assert_eq!(latest_version(&temp_dir.path().join("patches")).unwrap(), 0);

        // Version 0 is the empty tree
        let target = temp_dir.path().join("empty");
        let result = respatch.deploy(&target, VersionSpec::Latest).unwrap();
        assert_eq!(result.version, 0);
        assert_eq!(result.files_deployed, 0);
        assert_eq!(result.tree_digest, EMPTY_TREE_DIGEST);
        assert!(target.is_dir());

        assert!(respatch.verify().unwrap().is_valid());
    }

    #[test]
    fn test_empty_files_and_nested_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(tree.join("a/b/c")).unwrap();
        fs::write(tree.join("a/b/c/empty.txt"), "").unwrap();
        fs::write(tree.join("a/top.txt"), "top\n").unwrap();
        respatch.commit(&tree).unwrap();

        fs::remove_dir_all(tree.join("a/b")).unwrap();
        respatch.commit(&tree).unwrap();

        let v1 = temp_dir.path().join("v1");
        respatch.deploy(&v1, VersionSpec::Exact(1)).unwrap();
        assert_eq!(fs::read(v1.join("a/b/c/empty.txt")).unwrap(), b"");

        let v2 = temp_dir.path().join("v2");
        respatch.deploy(&v2, VersionSpec::Exact(2)).unwrap();
        assert!(!v2.join("a/b").exists());
        assert_eq!(fs::read_to_string(v2.join("a/top.txt")).unwrap(), "top\n");
    }

    #[test]
    fn test_missing_trailing_newline() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();

        fs::write(tree.join("f.txt"), "one\ntwo").unwrap();
        respatch.commit(&tree).unwrap();
        fs::write(tree.join("f.txt"), "one\ntwo\n").unwrap();
        respatch.commit(&tree).unwrap();
        fs::write(tree.join("f.txt"), "one\nthree").unwrap();
        respatch.commit(&tree).unwrap();

        for (version, expected) in [(1, "one\ntwo"), (2, "one\ntwo\n"), (3, "one\nthree")] {
            let target = temp_dir.path().join(format!("v{}", version));
            respatch.deploy(&target, VersionSpec::Exact(version)).unwrap();
            assert_eq!(fs::read_to_string(target.join("f.txt")).unwrap(), expected);
        }
    }

    #[test]
    fn test_blank_line_runs_round_trip() {
        for (first, second) in [("b\n\n\n\n", "\na\na"), ("\na\na", "b\n\n\n\n")] {
            let temp_dir = TempDir::new().unwrap();
            let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
            let tree = temp_dir.path().join("tree");
            fs::create_dir_all(&tree).unwrap();

            fs::write(tree.join("f"), first).unwrap();
            respatch.commit(&tree).unwrap();
            fs::write(tree.join("f"), second).unwrap();
            respatch.commit(&tree).unwrap();

            let target = temp_dir.path().join("v1");
            respatch.deploy(&target, VersionSpec::Exact(1)).unwrap();
            assert_eq!(fs::read_to_string(target.join("f")).unwrap(), first);
            assert!(respatch.verify().unwrap().is_valid());
        }
    }

    #[test]
    fn test_carriage_return_line_endings() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();

        let versions = ["x\r", "x\ry\n", "dos\r\nline\r\n", "old mac\rstyle\r"];
        for content in versions {
            fs::write(tree.join("f"), content).unwrap();
            respatch.commit(&tree).unwrap();
        }

        for (index, expected) in versions.iter().enumerate() {
            let version = index as u32 + 1;
            let target = temp_dir.path().join(format!("v{}", version));
            respatch.deploy(&target, VersionSpec::Exact(version)).unwrap();
            assert_eq!(fs::read(target.join("f")).unwrap(), expected.as_bytes(), "version {}", version);
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();

        let names = ["файл.txt", "文件.txt", "file with spaces.txt"];
        let mut created = Vec::new();
        for name in &names {
            if fs::write(tree.join(name), format!("content of {}\n", name)).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            return;
        }

        respatch.commit(&tree).unwrap();
        let target = temp_dir.path().join("deployed");
        respatch.deploy(&target, VersionSpec::Latest).unwrap();
        for name in &created {
            assert_eq!(
                fs::read_to_string(target.join(name)).unwrap(),
                format!("content of {}\n", name)
            );
        }
    }

    #[test]
    fn test_binary_content_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("blob.bin"), [0u8, 1, 2, 3]).unwrap();

        let err = respatch.commit(&tree).unwrap_err();
        assert!(matches!(err, PatchError::BinaryContent(_)), "{}", err);
        assert_eq!(respatch.latest_version(), 0);
    }

    #[test]
    fn test_deploy_into_non_empty_target() {
        let temp_dir = TempDir::new().unwrap();
        let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let tree = temp_dir.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("a.txt"), "a\n").unwrap();
        respatch.commit(&tree).unwrap();

        let target = temp_dir.path().join("busy");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("keep.txt"), "mine\n").unwrap();

        let err = respatch.deploy(&target, VersionSpec::Latest).unwrap_err();
        assert!(matches!(err, PatchError::DirectoryNotEmpty(_)));
        assert!(err.is_precondition());
        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "mine\n");
    }

    #[test]
    fn test_version_out_of_range() {
        let temp_dir = TempDir::new().unwrap();
        let respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
        let err = respatch
            .deploy(&temp_dir.path().join("t"), VersionSpec::Exact(4))
            .unwrap_err();
        assert!(matches!(err, PatchError::InvalidVersion { max: 0, .. }), "{}", err);
        assert!(parse_version("latest").is_ok());
        assert!(parse_version("-1").is_err());
    }

    #[test]
    fn test_permission_preservation() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let temp_dir = TempDir::new().unwrap();
            let mut respatch = Respatch::open(temp_dir.path().join("patches")).unwrap();
            let tree = temp_dir.path().join("tree");
            fs::create_dir_all(&tree).unwrap();

            let script = tree.join("run.sh");
            fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
            respatch.commit(&tree).unwrap();

            // Only the mode changes
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            let before = digest_tree(Some(&tree)).unwrap();
            assert_eq!(respatch.commit(&tree).unwrap(), Some(2));
            assert_eq!(digest_tree(Some(&tree)).unwrap(), before);

            for (version, expected) in [(1, 0o644), (2, 0o755)] {
                let target = temp_dir.path().join(format!("v{}", version));
                respatch.deploy(&target, VersionSpec::Exact(version)).unwrap();
                let mode = fs::metadata(target.join("run.sh")).unwrap().permissions().mode() & 0o777;
                assert_eq!(mode & 0o111, expected & 0o111, "version {}: {:o}", version, mode);
            }
        }
    }
}
