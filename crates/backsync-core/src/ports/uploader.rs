//! Uploader port (driven/secondary port)
//!
//! Writes a single local file into a resolved storage backend. The engine
//! opens a fresh [`FileStream`] for every attempt, so an implementation may
//! consume the handle freely.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::path_resolver::ResolvedTarget;

/// Progress callback, called with a percentage in `0.0..=100.0`
pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// An open local file plus the metadata a backend needs to store it
#[derive(Debug)]
pub struct FileStream {
    /// Absolute path of the source file
    pub path: PathBuf,
    /// File name to create in the destination directory
    pub name: String,
    /// Size in bytes at open time
    pub size: u64,
    /// Modification time at open time
    pub modified: DateTime<Utc>,
    /// Short-lived read handle, closed when the stream is dropped
    pub file: File,
}

impl FileStream {
    /// Opens `path` and captures its current size and modification time
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("path has no file name: {}", path.display()),
                )
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            file,
        })
    }
}

/// Port trait for putting files into a storage backend
#[async_trait::async_trait]
pub trait IUploader: Send + Sync {
    /// Stores `stream` as `target.actual_path/<stream.name>`
    ///
    /// With `overwrite = true` an existing object of the same name is replaced.
    async fn put(
        &self,
        target: &ResolvedTarget,
        stream: FileStream,
        progress: &ProgressFn<'_>,
        overwrite: bool,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_open_captures_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"hello").unwrap();
        drop(f);

        let stream = FileStream::open(&path).unwrap();
        assert_eq!(stream.name, "report.txt");
        assert_eq!(stream.size, 5);
        assert_eq!(stream.path, path);
    }

    #[test]
    fn test_open_rejects_directory_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStream::open(dir.path()).is_err());
        assert!(FileStream::open(&dir.path().join("missing")).is_err());
    }
}
