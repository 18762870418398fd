//! backsync Sync - Directory-to-remote backup engine
//!
//! Provides:
//! - Recursive watching emulated on a non-recursive notifier
//! - Per-job polling with manifest reconciliation
//! - Fan-out of changed files to every configured destination
//! - A retrying, deduplicating, optionally durable upload queue
//!
//! ## Modules
//!
//! - [`engine`] - Job lifecycle, event handling and the run-all trigger
//! - [`registry`] - Process-wide map of active watches
//! - [`watcher`] - Directory subscriptions over `notify`
//! - [`scheduler`] - Per-job poll timers and reconciliation
//! - [`dispatcher`] - Destination resolution and task submission
//! - [`queue`] - Upload task queue
//! - [`manifest`] - Last-seen modification time stores
//! - [`matcher`] - Gitignore-style ignore patterns
//! - [`walker`] - Ignore-aware tree walk
//! - [`filesystem`] - Local mount-table resolver and directory uploader

pub mod dispatcher;
pub mod engine;
pub mod filesystem;
pub mod guard;
pub mod manifest;
pub mod matcher;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod walker;
pub mod watcher;

use std::path::PathBuf;

use backsync_core::domain::{DomainError, JobId};
use backsync_core::ports::ResolveError;
use thiserror::Error;

/// Errors that can occur while managing or running backup jobs
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// The source of a job exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Another job already watches this source directory
    #[error("Source directory is already watched: {0}")]
    AlreadyWatched(PathBuf),

    /// An ignore pattern could not be compiled
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(String),

    /// A destination could not be mapped to a storage backend
    #[error("Destination error: {0}")]
    Resolve(#[from] ResolveError),

    /// The backend covering a destination is read-only
    #[error("Storage mounted at {0} does not accept uploads")]
    UploadNotSupported(String),

    /// A domain-level error propagated from backsync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),

    /// The record store rejected an operation
    #[error("Record store error: {0}")]
    Store(anyhow::Error),

    /// The filesystem notifier failed
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// This node has no server id configured
    #[error("Server id is not set")]
    ServerIdNotSet,

    /// No job with the given id exists
    #[error("Backup job not found: {0}")]
    JobNotFound(JobId),
}
