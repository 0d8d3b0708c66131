//! Iterative depth-first file enumeration for rebuild and verify.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Visit every regular file beneath `root` with an explicit stack.
///
/// Unreadable directories are skipped. Symlinks are skipped unless
/// `follow_symlinks` is set; when following, each directory is entered at
/// most once so link cycles terminate.
pub fn walk_files<F>(root: &Path, follow_symlinks: bool, mut visit: F)
where
    F: FnMut(&Path),
{
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut entered: HashSet<PathBuf> = HashSet::new();

    while let Some(dir) = stack.pop() {
        if follow_symlinks {
            let canonical = fs::canonicalize(&dir).unwrap_or_else(|_| dir.clone());
            if !entered.insert(canonical) {
                continue;
            }
        }

        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();

            let (is_dir, is_file) = if file_type.is_symlink() {
                if !follow_symlinks {
                    continue;
                }
                match fs::metadata(&path) {
                    Ok(meta) => (meta.is_dir(), meta.is_file()),
                    Err(_) => continue,
                }
            } else {
                (file_type.is_dir(), file_type.is_file())
            };

            if is_dir {
                stack.push(path);
            } else if is_file {
                visit(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(root: &Path, follow: bool) -> Vec<PathBuf> {
        let mut out = Vec::new();
        walk_files(root, follow, |p| out.push(p.strip_prefix(root).unwrap().to_path_buf()));
        out.sort();
        out
    }

    #[test]
    fn finds_nested_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("top.txt"), "1").unwrap();
        fs::write(dir.path().join("a/b/c/deep.txt"), "2").unwrap();
        fs::write(dir.path().join("a/mid.txt"), "3").unwrap();

        assert_eq!(
            collect(dir.path(), false),
            vec![
                PathBuf::from("a/b/c/deep.txt"),
                PathBuf::from("a/mid.txt"),
                PathBuf::from("top.txt"),
            ]
        );
    }

    #[test]
    fn missing_root_visits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect(&dir.path().join("nope"), false).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_skipped_unless_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("ext.txt"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        fs::write(dir.path().join("own.txt"), "y").unwrap();

        assert_eq!(collect(dir.path(), false), vec![PathBuf::from("own.txt")]);
        assert_eq!(
            collect(dir.path(), true),
            vec![PathBuf::from("link/ext.txt"), PathBuf::from("own.txt")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/f.txt"), "z").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();

        let files = collect(dir.path(), true);
        assert!(files.contains(&PathBuf::from("sub/f.txt")));
        assert_eq!(files.len(), 1);
    }
}
