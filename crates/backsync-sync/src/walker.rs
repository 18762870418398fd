//! Ignore-aware directory traversal
//!
//! One walk serves three callers: the event-mode subscription walk, the
//! polling reconciliation and the initial upload. Ignored directories are
//! pruned with `filter_entry`, so their subtree is never read.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::manifest::is_manifest_file;
use crate::matcher::IgnoreMatcher;

/// A regular file found by [`scan_tree`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    /// Absolute path
    pub path: PathBuf,
    /// Modification time at walk time
    pub modified: DateTime<Utc>,
}

/// Everything a walk found below (and including) the root
#[derive(Debug, Default)]
pub struct TreeScan {
    /// Non-ignored directories, root first
    pub directories: Vec<PathBuf>,
    /// Non-ignored regular files
    pub files: Vec<WalkedFile>,
    /// Entries skipped because they could not be read
    pub errors: usize,
}

/// Walks `root`, skipping ignored entries and the manifest files
///
/// Unreadable entries are logged and skipped; the walk never aborts.
pub fn scan_tree(root: &Path, matcher: &IgnoreMatcher) -> TreeScan {
    let mut scan = TreeScan::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !matcher.is_ignored(entry.path(), entry.file_type().is_dir())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = ?e.path(), error = %e, "Skipping unreadable entry");
                scan.errors += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            scan.directories.push(entry.into_path());
            continue;
        }
        if !file_type.is_file() || is_manifest_file(entry.path()) {
            continue;
        }

        let modified = entry
            .metadata()
            .map_err(std::io::Error::from)
            .and_then(|m| m.modified());
        match modified {
            Ok(mtime) => scan.files.push(WalkedFile {
                path: entry.into_path(),
                modified: DateTime::<Utc>::from(mtime),
            }),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Cannot read modification time");
                scan.errors += 1;
            }
        }
    }

    debug!(
        root = %root.display(),
        directories = scan.directories.len(),
        files = scan.files.len(),
        errors = scan.errors,
        "Tree scan complete"
    );
    scan
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::manifest::MANIFEST_FILE_NAME;

    fn names(scan: &TreeScan, root: &Path) -> (Vec<String>, Vec<String>) {
        let rel = |p: &Path| p.strip_prefix(root).unwrap().to_string_lossy().into_owned();
        (
            scan.directories.iter().map(|d| rel(d)).collect(),
            scan.files.iter().map(|f| rel(&f.path)).collect(),
        )
    }

    #[test]
    fn test_scan_prunes_ignored_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("node_modules/x")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("node_modules/x/y.txt"), "y").unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.tmp"), "b").unwrap();
        fs::write(root.join(MANIFEST_FILE_NAME), "{}").unwrap();

        let matcher =
            IgnoreMatcher::new(root, &["node_modules".to_string(), "*.tmp".to_string()]).unwrap();
        let scan = scan_tree(root, &matcher);
        let (dirs, files) = names(&scan, root);

        assert_eq!(dirs, vec!["".to_string(), "src".to_string()]);
        assert_eq!(files, vec!["a.txt".to_string(), "src/main.rs".to_string()]);
        assert_eq!(scan.errors, 0);
    }

    #[test]
    fn test_scan_missing_root_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let scan = scan_tree(&missing, &IgnoreMatcher::empty(&missing));
        assert!(scan.directories.is_empty());
        assert!(scan.files.is_empty());
        assert_eq!(scan.errors, 1);
    }
}
