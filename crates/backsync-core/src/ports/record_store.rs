//! Record store port (driven/secondary port)
//!
//! Persistence for backup jobs and for the per-file "last backed up
//! modification time" rows used by the shared-store manifest.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, remote database) and don't need domain-level classification.
//! - Jobs are node-local; listing is always scoped by `server_id`.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::domain::{BackupJob, JobId};

/// Port trait for persistent job and timestamp storage
#[async_trait::async_trait]
pub trait IRecordStore: Send + Sync {
    // --- BackupJob operations ---

    /// Inserts a new job and returns the id assigned to it
    async fn create_job(&self, job: &BackupJob) -> anyhow::Result<JobId>;

    /// Replaces the stored job with the same id
    async fn update_job(&self, job: &BackupJob) -> anyhow::Result<()>;

    /// Retrieves a job by id
    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<BackupJob>>;

    /// Deletes a job by id (no-op if absent)
    async fn delete_job(&self, id: JobId) -> anyhow::Result<()>;

    /// All jobs owned by the given node
    async fn list_jobs_for_node(&self, server_id: &str) -> anyhow::Result<Vec<BackupJob>>;

    /// One page of the node's jobs (1-based `page`) plus the total count
    async fn list_jobs(
        &self,
        server_id: &str,
        page: u32,
        per_page: u32,
    ) -> anyhow::Result<(Vec<BackupJob>, u64)>;

    // --- File timestamp operations ---

    /// Recorded modification time of `path`, if any
    async fn get_file_timestamp(&self, path: &Path) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Records (insert or update) the modification time of `path`
    async fn set_file_timestamp(&self, path: &Path, modified: DateTime<Utc>) -> anyhow::Result<()>;
}
