//! Local storage adapters (secondary/driven adapters)
//!
//! Lets the daemon run without external storage drivers:
//!
//! - [`MountTableResolver`] implements [`IPathResolver`] over the configured
//!   storages: the storage with the longest mount path that prefixes the
//!   destination wins, and the remainder becomes the backend-local path.
//! - [`LocalDirectoryUploader`] implements [`IUploader`] by copying into the
//!   storage's local root.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content goes to a hidden temporary file in the
//!   target directory and is renamed over the final name, so a crash never
//!   leaves a truncated backup.
//! - **Overwrite**: with `overwrite = false` an existing target is an error.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use backsync_core::config::StorageConfig;
use backsync_core::domain::backup_job::clean_slash_path;
use backsync_core::ports::{
    FileStream, IPathResolver, IUploader, ProgressFn, ResolveError, ResolvedTarget, StorageHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};

/// Copy buffer size
const COPY_CHUNK: usize = 64 * 1024;

// ============================================================================
// MountTableResolver
// ============================================================================

#[derive(Debug, Clone)]
struct Mount {
    path: String,
    no_upload: bool,
}

/// Longest-prefix resolver over a static mount table
#[derive(Debug, Clone, Default)]
pub struct MountTableResolver {
    mounts: Vec<Mount>,
}

impl MountTableResolver {
    pub fn new(storages: &[StorageConfig]) -> Self {
        let mounts = storages
            .iter()
            .map(|s| Mount {
                path: clean_slash_path(&s.mount_path),
                no_upload: s.no_upload,
            })
            .collect();
        Self { mounts }
    }

    /// Mount paths in configuration order
    pub fn mount_paths(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.path.as_str()).collect()
    }
}

/// Returns the part of `path` below `mount`, or `None` if `mount` does not
/// cover `path` on a segment boundary
fn strip_mount<'a>(path: &'a str, mount: &str) -> Option<&'a str> {
    if mount == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(mount)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

impl IPathResolver for MountTableResolver {
    fn resolve(&self, path: &str) -> Result<ResolvedTarget, ResolveError> {
        let path = clean_slash_path(path);
        if !path.starts_with('/') {
            return Err(ResolveError::InvalidPath(path));
        }

        let (mount, rest) = self
            .mounts
            .iter()
            .filter_map(|m| strip_mount(&path, &m.path).map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.path.len())
            .ok_or_else(|| ResolveError::NotFound(path.clone()))?;

        let actual_path = if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        };

        Ok(ResolvedTarget {
            storage: StorageHandle {
                mount_path: mount.path.clone(),
                no_upload: mount.no_upload,
            },
            actual_path,
        })
    }
}

// ============================================================================
// LocalDirectoryUploader
// ============================================================================

/// Uploader writing into local directories, one per mount
#[derive(Debug, Clone, Default)]
pub struct LocalDirectoryUploader {
    roots: HashMap<String, PathBuf>,
}

impl LocalDirectoryUploader {
    pub fn new(storages: &[StorageConfig]) -> Self {
        let roots = storages
            .iter()
            .map(|s| (clean_slash_path(&s.mount_path), s.root.clone()))
            .collect();
        Self { roots }
    }

    /// Local directory a resolved target maps to
    pub fn target_dir(&self, target: &ResolvedTarget) -> Option<PathBuf> {
        let root = self.roots.get(&target.storage.mount_path)?;
        let rel = target.actual_path.trim_start_matches('/');
        Some(if rel.is_empty() {
            root.clone()
        } else {
            root.join(rel)
        })
    }
}

#[async_trait::async_trait]
impl IUploader for LocalDirectoryUploader {
    #[instrument(
        skip(self, target, stream, progress),
        fields(file = %stream.path.display(), mount = %target.storage.mount_path, bytes = stream.size)
    )]
    async fn put(
        &self,
        target: &ResolvedTarget,
        stream: FileStream,
        progress: &ProgressFn<'_>,
        overwrite: bool,
    ) -> anyhow::Result<()> {
        if target.storage.no_upload {
            anyhow::bail!(
                "storage mounted at {} does not accept uploads",
                target.storage.mount_path
            );
        }
        let dir = self.target_dir(target).with_context(|| {
            format!("no local root for storage {}", target.storage.mount_path)
        })?;
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let final_path = dir.join(&stream.name);
        if !overwrite && tokio::fs::try_exists(&final_path).await? {
            anyhow::bail!("{} already exists", final_path.display());
        }

        let tmp_path = dir.join(format!(".{}.backsync-tmp", stream.name));
        debug!(tmp = %tmp_path.display(), "writing to temporary file");

        let total = stream.size;
        let mut reader = tokio::fs::File::from_std(stream.file);
        let mut writer = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied: u64 = 0;
        let copy_result: std::io::Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
                copied += n as u64;
                if total > 0 {
                    progress((copied as f64 / total as f64 * 100.0).min(100.0));
                }
            }
            writer.flush().await?;
            writer.sync_all().await
        }
        .await;

        if let Err(e) = copy_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("Failed to copy to {}", tmp_path.display()));
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .with_context(|| format!("Failed to move into {}", final_path.display()))?;
        progress(100.0);

        debug!(target = %final_path.display(), bytes = copied, "upload complete");
        Ok(())
    }
}
