//! SQLite implementation of IRecordStore
//!
//! Concrete SQLite-based implementation of the record store port defined in
//! backsync-core. It handles domain type conversion and SQL construction.
//!
//! ## Type Mapping
//!
//! | Domain Type     | SQL Type | Strategy                                      |
//! |-----------------|----------|-----------------------------------------------|
//! | JobId           | INTEGER  | Row id via `.get()` / `JobId::new()`          |
//! | PathBuf         | TEXT     | Lossy UTF-8 string                            |
//! | Vec<String>     | TEXT     | `;`-joined via `BackupJob::join_list`         |
//! | WatchMode       | INTEGER  | `WatchMode::code()` / `WatchMode::from_code()`|
//! | bool            | INTEGER  | 0 / 1                                         |
//! | DateTime<Utc>   | TEXT     | RFC 3339 with nanoseconds                     |

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use backsync_core::domain::{BackupJob, JobId, WatchMode};
use backsync_core::ports::IRecordStore;

use crate::CacheError;

/// SQLite-based implementation of the record store port
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Creates a new store over the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Formats a timestamp for storage, keeping sub-second precision
///
/// Modification times are compared with `>`; truncating them would make a
/// file written twice within one second look unchanged.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's CURRENT_TIMESTAMP format, for rows written by hand
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Reconstruct a BackupJob from a database row
fn job_from_row(row: &SqliteRow) -> Result<BackupJob, CacheError> {
    let id: i64 = row.get("id");
    let mode_code: i64 = row.get("mode");
    let polling_interval: i64 = row.get("polling_interval");
    let dst: String = row.get("dst");
    let ignore: String = row.get("ignore_patterns");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let mode = WatchMode::from_code(mode_code)
        .map_err(|e| CacheError::SerializationError(format!("Job {}: {}", id, e)))?;

    Ok(BackupJob {
        id: JobId::new(id),
        server_id: row.get("server_id"),
        src: PathBuf::from(row.get::<String, _>("src")),
        dst: BackupJob::parse_list(&dst),
        ignore: BackupJob::parse_list(&ignore),
        disabled: row.get::<i64, _>("disabled") != 0,
        mode,
        polling_interval_minutes: u64::try_from(polling_interval).unwrap_or(0),
        init_upload: row.get::<i64, _>("init_upload") != 0,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn interval_to_sql(job: &BackupJob) -> i64 {
    i64::try_from(job.polling_interval_minutes).unwrap_or(i64::MAX)
}

// ============================================================================
// IRecordStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IRecordStore for SqliteRecordStore {
    // --- BackupJob operations ---

    async fn create_job(&self, job: &BackupJob) -> anyhow::Result<JobId> {
        let result = sqlx::query(
            "INSERT INTO backup_jobs \
             (server_id, src, dst, ignore_patterns, disabled, mode, \
              polling_interval, init_upload, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.server_id)
        .bind(path_to_string(&job.src))
        .bind(job.dst_string())
        .bind(job.ignore_string())
        .bind(i64::from(job.disabled))
        .bind(job.mode.code())
        .bind(interval_to_sql(job))
        .bind(i64::from(job.init_upload))
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.updated_at))
        .execute(&self.pool)
        .await?;

        let id = JobId::new(result.last_insert_rowid());
        tracing::trace!(job_id = %id, src = %job.src.display(), "Created backup job");
        Ok(id)
    }

    async fn update_job(&self, job: &BackupJob) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET \
             server_id = ?, src = ?, dst = ?, ignore_patterns = ?, disabled = ?, \
             mode = ?, polling_interval = ?, init_upload = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&job.server_id)
        .bind(path_to_string(&job.src))
        .bind(job.dst_string())
        .bind(job.ignore_string())
        .bind(i64::from(job.disabled))
        .bind(job.mode.code())
        .bind(interval_to_sql(job))
        .bind(i64::from(job.init_upload))
        .bind(format_datetime(&job.updated_at))
        .bind(job.id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Backup job {} not found", job.id);
        }

        tracing::trace!(job_id = %job.id, "Updated backup job");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<BackupJob>> {
        let row = sqlx::query("SELECT * FROM backup_jobs WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(job_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn delete_job(&self, id: JobId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await?;

        tracing::trace!(job_id = %id, "Deleted backup job");
        Ok(())
    }

    async fn list_jobs_for_node(&self, server_id: &str) -> anyhow::Result<Vec<BackupJob>> {
        let rows = sqlx::query("SELECT * FROM backup_jobs WHERE server_id = ? ORDER BY id ASC")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| job_from_row(r).map_err(anyhow::Error::from))
            .collect()
    }

    async fn list_jobs(
        &self,
        server_id: &str,
        page: u32,
        per_page: u32,
    ) -> anyhow::Result<(Vec<BackupJob>, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_jobs WHERE server_id = ?")
            .bind(server_id)
            .fetch_one(&self.pool)
            .await?;

        let per_page = per_page.max(1);
        let offset = i64::from(page.max(1) - 1) * i64::from(per_page);

        let rows = sqlx::query(
            "SELECT * FROM backup_jobs WHERE server_id = ? ORDER BY id ASC LIMIT ? OFFSET ?",
        )
        .bind(server_id)
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((jobs, u64::try_from(total).unwrap_or(0)))
    }

    // --- File timestamp operations ---

    async fn get_file_timestamp(&self, path: &Path) -> anyhow::Result<Option<DateTime<Utc>>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT last_modified FROM file_timestamps WHERE file_path = ?")
                .bind(path_to_string(path))
                .fetch_optional(&self.pool)
                .await?;

        match value {
            Some(ref s) => Ok(Some(parse_datetime(s)?)),
            None => Ok(None),
        }
    }

    async fn set_file_timestamp(&self, path: &Path, modified: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO file_timestamps (file_path, last_modified) VALUES (?, ?) \
             ON CONFLICT(file_path) DO UPDATE SET last_modified = excluded.last_modified",
        )
        .bind(path_to_string(path))
        .bind(format_datetime(&modified))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
