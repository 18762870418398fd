//! Path resolver port (driven/secondary port)
//!
//! Destinations are written as paths in a virtual remote namespace
//! (`/remote/backup1/photos`). A resolver maps such a path to the storage
//! backend mounted over it and the path local to that backend.
//!
//! ## Design Notes
//!
//! - Resolution is synchronous: implementations consult an in-memory mount
//!   table and never perform network I/O.
//! - A path that no backend covers yields [`ResolveError::NotFound`]; callers
//!   treat this as a configuration error at validation time and as a skipped
//!   destination at dispatch time.

use thiserror::Error;

/// A storage backend as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageHandle {
    /// Virtual path the backend is mounted at (e.g. `/remote/backup1`)
    pub mount_path: String,
    /// Backends that are read-only reject uploads
    pub no_upload: bool,
}

/// Result of resolving a virtual destination path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedTarget {
    /// Backend covering the path
    pub storage: StorageHandle,
    /// Path inside the backend (always starts with `/`)
    pub actual_path: String,
}

/// Errors returned by [`IPathResolver::resolve`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No mounted backend covers the path
    #[error("Storage not found for path: {0}")]
    NotFound(String),

    /// The path is malformed (relative, empty)
    #[error("Invalid destination path: {0}")]
    InvalidPath(String),
}

/// Port trait mapping virtual destination paths onto storage backends
pub trait IPathResolver: Send + Sync {
    /// Resolves `path` to its backend and backend-local path
    fn resolve(&self, path: &str) -> Result<ResolvedTarget, ResolveError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::NotFound("/nowhere".to_string());
        assert_eq!(err.to_string(), "Storage not found for path: /nowhere");
    }
}
