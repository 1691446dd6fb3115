//! Utility functions for respatch
//!
//! File hashing, atomic writes, permission handling, tree copying and the
//! path rules shared by every component that turns an on-disk path into a
//! logical, repository-relative one (and back).
//!
//! ## Logical paths
//!
//! Patches name files by *logical path*: relative, `/`-separated, with no
//! `.` or `..` components. [`logical_path`] converts a relative filesystem path
//! to that form and [`validate_logical_path`] rejects anything that could
//! escape the directory a patch is applied to.
//!
//! ## Thread Safety
//!
//! All utility functions are stateless and can be called concurrently.

use crate::error::{PatchError, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::trace;
use walkdir::WalkDir;

/// Hash a file's content using SHA-256
///
/// Streams the file through an 8KB buffer and returns the digest as 64
/// lowercase hex characters.
///
/// # Errors
///
/// - [`PatchError::Io`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
///
/// ```rust,ignore
/// let hash = hash_data(b"Hello, world!");
/// assert_eq!(hash.len(), 64);
/// ```
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Whether a string is a 64 character lowercase hex digest
pub fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Get the permission bits of a file
#[cfg(unix)]
pub fn get_permissions(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o7777)
}

/// Get permissions (Windows implementation)
///
/// Maps the read-only attribute onto Unix-like bits.
#[cfg(windows)]
pub fn get_permissions(path: &Path) -> Result<u32> {
    let metadata = fs::metadata(path)?;
    Ok(if metadata.permissions().readonly() { 0o444 } else { 0o644 })
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions (Windows implementation)
///
/// Only the owner write bit is honored, through the read-only attribute.
#[cfg(windows)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Atomic file write (write to temp file then rename)
///
/// The target is never observable in a partially written state. The temporary
/// file lives next to the target so the rename stays on one filesystem.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    stage_beside(path, content)?
        .persist(path)
        .map_err(|e| e.error)?;
    Ok(())
}

/// Stage `content` in a uniquely named scratch file in `path`'s directory
///
/// The name is created exclusively, so staging never touches a neighbouring
/// file. Dropping the returned handle removes the scratch file.
pub fn stage_beside(path: &Path, content: &[u8]) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut builder = tempfile::Builder::new();
    builder.prefix(".respatch-").suffix(".tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Plain-create bits, narrowed by the umask
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut temp = builder.tempfile_in(dir)?;
    temp.write_all(content)?;
    Ok(temp)
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first and only canonicalizes when that fails, so
/// symlinked bases still work.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            PatchError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Convert a relative filesystem path to a logical, `/`-separated path
pub fn logical_path(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| PatchError::InvalidPath(relative.display().to_string()))?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => return Err(PatchError::InvalidPath(relative.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(PatchError::InvalidPath(relative.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Reject logical paths that are empty, absolute or climb out of the tree
pub fn validate_logical_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.contains('\0')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(PatchError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Resolve a validated logical path under `root`
pub fn resolve_logical(root: &Path, path: &str) -> Result<PathBuf> {
    validate_logical_path(path)?;
    Ok(path.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part)))
}

/// Whether a directory has no entries (a missing directory counts as empty)
pub fn is_dir_empty(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(true);
    }
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Remove directory if empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove empty directories between a deleted file and `root` (exclusive)
pub fn prune_empty_parents(root: &Path, file: &Path) -> Result<()> {
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if !remove_dir_if_empty(dir)? {
            break;
        }
        current = dir.parent();
    }
    Ok(())
}

/// Delete every entry inside `path`, keeping the directory itself
pub fn clear_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&entry_path)?;
        } else {
            fs::remove_file(&entry_path)?;
        }
    }
    Ok(())
}

/// Recursively copy the regular files and directories of `src` into `dst`
///
/// `fs::copy` carries permission bits along. Symlinks are skipped, matching
/// what tree digests consider.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = make_relative(entry.path(), src)?;
        let target = dst.join(&relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    trace!("Copied {} files from {:?} to {:?}", copied, src, dst);
    Ok(copied)
}
