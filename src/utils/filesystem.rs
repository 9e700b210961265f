use crate::core::error::EngineError;
/// File system utilities for download management
use std::path::{Component, Path, PathBuf};
use sysinfo::Disks;
use tracing::warn;

/// Free bytes on the filesystem holding `path`, when it can be determined.
/// Matches the disk with the longest mount-point prefix of the path.
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let depth = mount.components().count();
            if best.map_or(true, |(d, _)| depth > d) {
                best = Some((depth, disk.available_space()));
            }
        }
    }
    best.map(|(_, space)| space)
}

/// Fail with a disk error when the filesystem holding `path` has less than
/// `required` bytes free. Unknown filesystems pass; the write itself will
/// surface ENOSPC if the probe was wrong.
pub fn validate_disk_space(path: &Path, required: u64) -> Result<(), EngineError> {
    let dir = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    };
    match available_space(dir) {
        Some(free) if free < required => Err(EngineError::Disk(format!(
            "insufficient disk space at {}: {free} bytes free, {required} required",
            dir.display()
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(path = %dir.display(), "could not determine free disk space");
            Ok(())
        }
    }
}

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// True when `candidate` stays inside `base` after normalization. Used to
/// reject save paths that escape the declared download folder via
/// traversal segments.
pub fn path_is_within(base: &Path, candidate: &Path) -> bool {
    normalize(candidate).starts_with(normalize(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_path_containment() {
        let base = Path::new("/downloads");
        assert!(path_is_within(base, Path::new("/downloads/game.zip")));
        assert!(path_is_within(base, Path::new("/downloads/sub/./game.zip")));
        assert!(!path_is_within(base, Path::new("/downloads/../etc/passwd")));
        assert!(!path_is_within(base, Path::new("/elsewhere/game.zip")));
        assert!(!path_is_within(
            base,
            Path::new("/downloads/sub/../../../etc")
        ));
    }

    #[test]
    fn test_validate_disk_space_passes_for_small_requirement() {
        let dir = tempdir().unwrap();
        // one byte must always fit
        validate_disk_space(dir.path(), 1).unwrap();
    }

    #[test]
    fn test_validate_disk_space_rejects_absurd_requirement() {
        let dir = tempdir().unwrap();
        if available_space(dir.path()).is_some() {
            let err = validate_disk_space(dir.path(), u64::MAX).unwrap_err();
            assert_eq!(err.error_code(), "DISK");
        }
    }
}
