//! Last-backed-up modification time stores
//!
//! A file is considered modified when its current mtime is newer than the
//! recorded one, or when nothing is recorded. Two backings exist:
//!
//! - [`SidecarManifest`] keeps one hidden JSON file per directory mapping
//!   child file names to timestamps. Directories being updated are staged
//!   in memory until [`ManifestStore::flush`] writes them back wholesale;
//!   lookups in directories that are not staged read through to disk.
//! - [`RecordManifest`] keeps one row per absolute path in the record store.
//!
//! Read failures are logged and treated as "nothing recorded", which forces
//! a re-upload. Write failures are logged and otherwise ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backsync_core::ports::IRecordStore;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Name of the per-directory side-car manifest file
pub const MANIFEST_FILE_NAME: &str = ".backsync-manifest";

/// Returns true for the side-car manifest and its temporary write file
pub fn is_manifest_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(MANIFEST_FILE_NAME))
}

/// Abstract `{get, set}` store of last-seen modification times
#[async_trait::async_trait]
pub trait ManifestStore: Send + Sync {
    /// Recorded modification time of `path`
    async fn get(&self, path: &Path) -> Option<DateTime<Utc>>;

    /// Records the modification time of `path`
    async fn set(&self, path: &Path, modified: DateTime<Utc>);

    /// Marks `dir` as visited so the next flush writes its manifest even if
    /// none of its files changed
    async fn touch_dir(&self, _dir: &Path) {}

    /// Persists everything staged for directories under `root`
    async fn flush(&self, _root: &Path) {}

    /// Drops everything staged for directories under `root` unwritten
    async fn discard(&self, _root: &Path) {}

    /// Returns true if `current` is newer than the recorded time of `path`
    async fn is_modified(&self, path: &Path, current: DateTime<Utc>) -> bool {
        match self.get(path).await {
            Some(recorded) => current > recorded,
            None => true,
        }
    }
}

// ============================================================================
// SidecarManifest
// ============================================================================

type DirEntries = BTreeMap<String, DateTime<Utc>>;

/// Per-directory JSON manifests stored beside the files they describe
#[derive(Debug, Default)]
pub struct SidecarManifest {
    cache: Mutex<HashMap<PathBuf, DirEntries>>,
}

impl SidecarManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the manifest file for `dir`
    pub fn manifest_path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    /// Reads the manifest of `dir` from disk; missing or unreadable is empty
    pub async fn read_dir_manifest(dir: &Path) -> DirEntries {
        let path = Self::manifest_path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return DirEntries::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read manifest");
                return DirEntries::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt manifest, treating as empty");
                DirEntries::new()
            }
        }
    }

    async fn write_dir_manifest(dir: &Path, entries: &DirEntries) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let target = Self::manifest_path(dir);
        let tmp = dir.join(format!("{MANIFEST_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &target).await
    }

    /// Number of directories staged and not yet flushed
    pub async fn staged_dirs(&self) -> usize {
        self.cache.lock().await.len()
    }

    fn split(path: &Path) -> Option<(&Path, String)> {
        let dir = path.parent()?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        Some((dir, name))
    }
}

#[async_trait::async_trait]
impl ManifestStore for SidecarManifest {
    async fn get(&self, path: &Path) -> Option<DateTime<Utc>> {
        let (dir, name) = Self::split(path)?;
        if let Some(entries) = self.cache.lock().await.get(dir) {
            return entries.get(&name).copied();
        }
        Self::read_dir_manifest(dir).await.get(&name).copied()
    }

    async fn set(&self, path: &Path, modified: DateTime<Utc>) {
        let Some((dir, name)) = Self::split(path) else {
            return;
        };
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(dir) {
            let entries = Self::read_dir_manifest(dir).await;
            cache.insert(dir.to_path_buf(), entries);
        }
        if let Some(entries) = cache.get_mut(dir) {
            entries.insert(name, modified);
        }
    }

    async fn touch_dir(&self, dir: &Path) {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(dir) {
            let entries = Self::read_dir_manifest(dir).await;
            cache.insert(dir.to_path_buf(), entries);
        }
    }

    async fn flush(&self, root: &Path) {
        let mut cache = self.cache.lock().await;
        let dirs: Vec<PathBuf> = cache
            .keys()
            .filter(|d| d.starts_with(root))
            .cloned()
            .collect();

        for dir in dirs {
            let Some(entries) = cache.remove(&dir) else {
                continue;
            };
            // Drop entries for files that no longer exist
            let mut live = DirEntries::new();
            for (name, ts) in entries {
                if tokio::fs::symlink_metadata(dir.join(&name)).await.is_ok() {
                    live.insert(name, ts);
                }
            }
            match Self::write_dir_manifest(&dir, &live).await {
                Ok(()) => debug!(dir = %dir.display(), entries = live.len(), "Manifest written"),
                Err(e) => warn!(dir = %dir.display(), error = %e, "Cannot write manifest"),
            }
        }
    }

    async fn discard(&self, root: &Path) {
        let mut cache = self.cache.lock().await;
        let staged = cache.len();
        cache.retain(|dir, _| !dir.starts_with(root));
        let dropped = staged - cache.len();
        if dropped > 0 {
            debug!(root = %root.display(), dropped, "Discarded staged manifests");
        }
    }
}

// ============================================================================
// RecordManifest
// ============================================================================

/// Manifest kept as per-file rows in the record store
pub struct RecordManifest {
    store: Arc<dyn IRecordStore>,
}

impl RecordManifest {
    pub fn new(store: Arc<dyn IRecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ManifestStore for RecordManifest {
    async fn get(&self, path: &Path) -> Option<DateTime<Utc>> {
        match self.store.get_file_timestamp(path).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read file timestamp");
                None
            }
        }
    }

    async fn set(&self, path: &Path, modified: DateTime<Utc>) {
        if let Err(e) = self.store.set_file_timestamp(path, modified).await {
            warn!(path = %path.display(), error = %e, "Cannot record file timestamp");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_is_manifest_file() {
        assert!(is_manifest_file(Path::new("/d/.backsync-manifest")));
        assert!(is_manifest_file(Path::new("/d/.backsync-manifest.tmp")));
        assert!(!is_manifest_file(Path::new("/d/a.txt")));
    }

    #[tokio::test]
    async fn test_sidecar_missing_manifest_means_modified() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = SidecarManifest::new();
        let file = dir.path().join("a.txt");
        assert!(manifest.get(&file).await.is_none());
        assert!(manifest.is_modified(&file, ts(10)).await);
    }

    #[tokio::test]
    async fn test_sidecar_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();

        let manifest = SidecarManifest::new();
        manifest.set(&file, ts(100)).await;
        manifest.flush(dir.path()).await;

        let on_disk = SidecarManifest::read_dir_manifest(dir.path()).await;
        assert_eq!(on_disk.get("a.txt"), Some(&ts(100)));
        assert!(!dir.path().join(".backsync-manifest.tmp").exists());

        let fresh = SidecarManifest::new();
        assert_eq!(fresh.get(&file).await, Some(ts(100)));
        assert!(!fresh.is_modified(&file, ts(100)).await);
        assert!(fresh.is_modified(&file, ts(101)).await);
    }

    #[tokio::test]
    async fn test_sidecar_touch_writes_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = SidecarManifest::new();
        manifest.touch_dir(dir.path()).await;
        manifest.flush(dir.path()).await;
        assert!(SidecarManifest::manifest_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_sidecar_flush_drops_vanished_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.txt");
        std::fs::write(&kept, "k").unwrap();

        let manifest = SidecarManifest::new();
        manifest.set(&kept, ts(1)).await;
        manifest.set(&dir.path().join("gone.txt"), ts(2)).await;
        manifest.flush(dir.path()).await;

        let on_disk = SidecarManifest::read_dir_manifest(dir.path()).await;
        assert_eq!(on_disk.len(), 1);
        assert!(on_disk.contains_key("kept.txt"));
    }

    #[tokio::test]
    async fn test_sidecar_corrupt_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(SidecarManifest::manifest_path(dir.path()), "not json").unwrap();
        let manifest = SidecarManifest::new();
        assert!(manifest.get(&dir.path().join("a.txt")).await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_of_unstaged_directory_is_not_retained() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();

        let manifest = SidecarManifest::new();
        manifest.set(&file, ts(100)).await;
        manifest.flush(dir.path()).await;
        assert_eq!(manifest.staged_dirs().await, 0);

        assert!(!manifest.is_modified(&file, ts(100)).await);
        assert!(manifest.get(&dir.path().join("other.txt")).await.is_none());
        assert_eq!(manifest.staged_dirs().await, 0);
    }

    #[tokio::test]
    async fn test_discard_drops_staged_entries_under_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::create_dir(a.path().join("sub")).unwrap();
        let manifest = SidecarManifest::new();
        manifest.touch_dir(a.path()).await;
        manifest.set(&a.path().join("sub/x.txt"), ts(5)).await;
        manifest.touch_dir(b.path()).await;
        assert_eq!(manifest.staged_dirs().await, 3);

        manifest.discard(a.path()).await;
        assert_eq!(manifest.staged_dirs().await, 1);
        assert!(!SidecarManifest::manifest_path(&a.path().join("sub")).exists());
        assert!(manifest.get(&a.path().join("sub/x.txt")).await.is_none());
    }

    #[tokio::test]
    async fn test_flush_only_touches_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let manifest = SidecarManifest::new();
        manifest.touch_dir(a.path()).await;
        manifest.touch_dir(b.path()).await;

        manifest.flush(a.path()).await;
        assert!(SidecarManifest::manifest_path(a.path()).exists());
        assert!(!SidecarManifest::manifest_path(b.path()).exists());
    }
}
