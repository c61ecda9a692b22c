//! Artifact detection
//!
//! The package serializer has no return channel for the path it wrote when
//! it fails partway, so new artifacts are found by diffing directory
//! listings taken before and after a run. Safe because at most one run ever
//! writes into a session's directory at a time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Extension carried by every generated package file.
pub const PACKAGE_EXTENSION: &str = "apkg";

/// List the package files currently present in `dir`.
pub fn snapshot(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_package_extension(&path) {
            files.insert(path);
        }
    }
    Ok(files)
}

/// Diff the directory against a `before` snapshot. Returns the single new
/// package file, tie-broken by latest creation time when a run produced
/// more than one, or `None` when nothing new appeared.
pub fn detect_new(before: &HashSet<PathBuf>, dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let after = snapshot(dir)?;
    Ok(after
        .into_iter()
        .filter(|path| !before.contains(path))
        .max_by_key(|path| creation_time(path)))
}

pub fn has_package_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Creation time where the platform records it, modification time
/// otherwise.
fn creation_time(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn snapshot_lists_only_package_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.apkg");
        touch(dir.path(), "notes.txt");

        let snap = snapshot(dir.path()).unwrap();
        assert_eq!(snap.len(), 1);
        assert!(snap.contains(&a));
    }

    #[test]
    fn detect_new_finds_the_single_added_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.apkg");
        touch(dir.path(), "b.apkg");
        let before = snapshot(dir.path()).unwrap();

        let c = touch(dir.path(), "c.apkg");
        let found = detect_new(&before, dir.path()).unwrap();
        assert_eq!(found, Some(c));
    }

    #[test]
    fn identical_before_and_after_detects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.apkg");
        let before = snapshot(dir.path()).unwrap();

        assert_eq!(detect_new(&before, dir.path()).unwrap(), None);
    }

    #[test]
    fn multiple_new_files_tie_break_on_newest() {
        let dir = tempfile::tempdir().unwrap();
        let before = snapshot(dir.path()).unwrap();

        touch(dir.path(), "first.apkg");
        // Filesystem timestamp granularity can be coarse; force an
        // observable gap before writing the second file.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let second = touch(dir.path(), "second.apkg");

        let found = detect_new(&before, dir.path()).unwrap();
        assert_eq!(found, Some(second));
    }

    #[test]
    fn non_package_additions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let before = snapshot(dir.path()).unwrap();
        touch(dir.path(), "scratch.json");

        assert_eq!(detect_new(&before, dir.path()).unwrap(), None);
    }
}
