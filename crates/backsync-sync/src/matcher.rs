//! Gitignore-style ignore matching
//!
//! A job's patterns are compiled once per activation into an
//! [`IgnoreMatcher`] rooted at the job's source directory. Paths are matched
//! relative to that root, and a path is ignored when it or any of its parent
//! directories matches, so `node_modules` hides everything beneath it.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::SyncError;

/// Compiled ignore patterns for one source root
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    root: PathBuf,
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Compiles `patterns` (gitignore line syntax) relative to `root`
    ///
    /// # Errors
    ///
    /// Returns `SyncError::InvalidPattern` for a line the glob compiler rejects.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self, SyncError> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
            builder
                .add_line(None, pattern)
                .map_err(|e| SyncError::InvalidPattern(format!("{pattern}: {e}")))?;
        }
        let gitignore = builder
            .build()
            .map_err(|e| SyncError::InvalidPattern(e.to_string()))?;

        Ok(Self {
            root: root.to_path_buf(),
            gitignore,
        })
    }

    /// A matcher that ignores nothing
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            gitignore: Gitignore::empty(),
        }
    }

    /// The source root patterns are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if `path` (absolute, below the root) is ignored
    ///
    /// The root itself and paths outside it are never ignored.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rel) => self.is_ignored_relative(rel, is_dir),
            Err(_) => false,
        }
    }

    /// Returns true if `rel`, relative to the root, is ignored
    pub fn is_ignored_relative(&self, rel: &Path, is_dir: bool) -> bool {
        if self.gitignore.is_empty() || rel.as_os_str().is_empty() || rel.has_root() {
            return false;
        }
        self.gitignore
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> IgnoreMatcher {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        IgnoreMatcher::new(Path::new("/data/docs"), &patterns).unwrap()
    }

    #[test]
    fn test_extension_pattern() {
        let m = matcher(&["*.tmp"]);
        assert!(m.is_ignored(Path::new("/data/docs/b.tmp"), false));
        assert!(m.is_ignored(Path::new("/data/docs/x/y/b.tmp"), false));
        assert!(!m.is_ignored(Path::new("/data/docs/a.txt"), false));
    }

    #[test]
    fn test_directory_pattern_covers_descendants() {
        let m = matcher(&["node_modules"]);
        assert!(m.is_ignored(Path::new("/data/docs/node_modules"), true));
        assert!(m.is_ignored(Path::new("/data/docs/node_modules/x/y.txt"), false));
        assert!(m.is_ignored(Path::new("/data/docs/web/node_modules/z.js"), false));
        assert!(!m.is_ignored(Path::new("/data/docs/src/main.js"), false));
    }

    #[test]
    fn test_trailing_slash_only_matches_directories() {
        let m = matcher(&["build/"]);
        assert!(m.is_ignored(Path::new("/data/docs/build"), true));
        assert!(!m.is_ignored(Path::new("/data/docs/build"), false));
    }

    #[test]
    fn test_negation() {
        let m = matcher(&["*.log", "!keep.log"]);
        assert!(m.is_ignored(Path::new("/data/docs/debug.log"), false));
        assert!(!m.is_ignored(Path::new("/data/docs/keep.log"), false));
    }

    #[test]
    fn test_root_and_outside_paths_never_ignored() {
        let m = matcher(&["*"]);
        assert!(!m.is_ignored(Path::new("/data/docs"), true));
        assert!(!m.is_ignored(Path::new("/elsewhere/file"), false));
    }

    #[test]
    fn test_empty_matcher() {
        let m = IgnoreMatcher::empty(Path::new("/data"));
        assert!(!m.is_ignored(Path::new("/data/a.tmp"), false));

        let blank = IgnoreMatcher::new(Path::new("/data"), &[" ".to_string()]).unwrap();
        assert!(!blank.is_ignored(Path::new("/data/a.tmp"), false));
    }
}
