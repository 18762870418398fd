//! Upload dispatcher
//!
//! Fans one changed file out to every destination of its job. A file at
//! `src/x/y.txt` with destination `D` goes into directory `D/x`. Each
//! destination is handled independently: one that cannot be resolved, or
//! whose storage refuses uploads, is logged and skipped while the others
//! proceed. Submission never waits for the upload itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backsync_core::domain::backup_job::clean_slash_path;
use backsync_core::domain::BackupJob;
use backsync_core::ports::IPathResolver;
use tracing::{debug, warn};

use crate::queue::{TaskQueue, UploadTask};

/// What happened to one file's fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// New tasks accepted by the queue
    pub submitted: usize,
    /// Tasks whose id was already outstanding
    pub deduplicated: usize,
    /// Destinations skipped (unresolvable or read-only)
    pub skipped: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.submitted += other.submitted;
        self.deduplicated += other.deduplicated;
        self.skipped += other.skipped;
    }
}

pub struct UploadDispatcher {
    resolver: Arc<dyn IPathResolver>,
    queue: Arc<TaskQueue>,
    destination_pause: Duration,
}

impl UploadDispatcher {
    pub fn new(
        resolver: Arc<dyn IPathResolver>,
        queue: Arc<TaskQueue>,
        destination_pause: Duration,
    ) -> Self {
        Self {
            resolver,
            queue,
            destination_pause,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Submits one upload task per destination of `job` for `file`
    pub async fn dispatch(&self, job: &BackupJob, file: &Path) -> DispatchReport {
        let mut report = DispatchReport::default();

        let Some(rel_dir) = file.parent().and_then(|dir| job.relative_path(dir)) else {
            warn!(
                job_id = %job.id,
                file = %file.display(),
                src = %job.src.display(),
                "File is outside the job source, not dispatching"
            );
            return report;
        };

        for (index, dst) in job.dst.iter().enumerate() {
            if index > 0 && !self.destination_pause.is_zero() {
                tokio::time::sleep(self.destination_pause).await;
            }

            let destination = destination_dir(dst, &rel_dir);
            match self.resolver.resolve(&destination) {
                Ok(target) if target.storage.no_upload => {
                    warn!(
                        job_id = %job.id,
                        destination = %destination,
                        mount = %target.storage.mount_path,
                        "Storage does not accept uploads, skipping destination"
                    );
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        destination = %destination,
                        error = %e,
                        "Cannot resolve destination, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            let task = UploadTask::new(job.id, file.to_path_buf(), destination);
            if self.queue.submit(task) {
                report.submitted += 1;
            } else {
                report.deduplicated += 1;
            }
        }

        debug!(
            job_id = %job.id,
            file = %file.display(),
            submitted = report.submitted,
            deduplicated = report.deduplicated,
            skipped = report.skipped,
            "Dispatched file"
        );
        report
    }
}

/// Joins a destination root and a slash-separated relative directory
pub fn destination_dir(dst: &str, rel_dir: &str) -> String {
    if rel_dir.is_empty() {
        clean_slash_path(dst)
    } else {
        clean_slash_path(&format!("{dst}/{rel_dir}"))
    }
}

#[cfg(test)]
mod tests {
    use backsync_core::ports::{ResolveError, ResolvedTarget, StorageHandle};

    use super::*;
    use crate::queue::QueueConfig;

    struct TableResolver;

    impl IPathResolver for TableResolver {
        fn resolve(&self, path: &str) -> Result<ResolvedTarget, ResolveError> {
            let (mount, no_upload) = if path.starts_with("/remote/ro") {
                ("/remote/ro", true)
            } else if path.starts_with("/remote/backup") {
                ("/remote", false)
            } else {
                return Err(ResolveError::NotFound(path.to_string()));
            };
            Ok(ResolvedTarget {
                storage: StorageHandle {
                    mount_path: mount.to_string(),
                    no_upload,
                },
                actual_path: path[mount.len()..].to_string(),
            })
        }
    }

    struct NeverUploader;

    #[async_trait::async_trait]
    impl backsync_core::ports::IUploader for NeverUploader {
        async fn put(
            &self,
            _target: &ResolvedTarget,
            _stream: backsync_core::ports::FileStream,
            _progress: &backsync_core::ports::ProgressFn<'_>,
            _overwrite: bool,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn dispatcher() -> UploadDispatcher {
        let resolver: Arc<dyn IPathResolver> = Arc::new(TableResolver);
        let queue = TaskQueue::new(
            QueueConfig {
                workers: 1,
                max_retry: 0,
                retry_delay: Duration::ZERO,
                persist_path: None,
                persist_debounce: Duration::from_secs(1),
                keep_succeeded: 64,
            },
            Arc::clone(&resolver),
            Arc::new(NeverUploader),
        );
        UploadDispatcher::new(resolver, Arc::new(queue), Duration::ZERO)
    }

    #[test]
    fn test_destination_dir() {
        assert_eq!(destination_dir("/remote/backup1", ""), "/remote/backup1");
        assert_eq!(destination_dir("/remote/backup1/", "x/y"), "/remote/backup1/x/y");
    }

    fn job_over(dir: &Path, dst: &[&str]) -> BackupJob {
        BackupJob::new(dir, dst.iter().map(|d| d.to_string()).collect())
    }

    #[tokio::test]
    async fn test_fan_out_one_task_per_destination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let file = dir.path().join("sub").join("a.txt");
        std::fs::write(&file, "a").unwrap();

        let d = dispatcher();
        let job = job_over(dir.path(), &["/remote/backup1", "/remote/backup2"]);

        let report = d.dispatch(&job, &file).await;
        assert_eq!(report.submitted, 2);

        let mut destinations: Vec<String> =
            d.queue().list().into_iter().map(|t| t.task.destination).collect();
        destinations.sort();
        assert_eq!(
            destinations,
            vec!["/remote/backup1/sub".to_string(), "/remote/backup2/sub".to_string()]
        );

        // Uploads never finish, so both ids are still outstanding
        let again = d.dispatch(&job, &file).await;
        assert_eq!(again.submitted, 0);
        assert_eq!(again.deduplicated, 2);
        assert_eq!(d.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_destination_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();

        let d = dispatcher();
        let job = job_over(dir.path(), &["/nowhere", "/remote/ro", "/remote/backup1"]);

        let report = d.dispatch(&job, &file).await;
        assert_eq!(report.skipped, 2);
        assert_eq!(report.submitted, 1);
        assert_eq!(d.queue().list()[0].task.destination, "/remote/backup1");
    }

    #[tokio::test]
    async fn test_file_outside_source_is_ignored() {
        let d = dispatcher();
        let job = BackupJob::new("/data/docs", vec!["/remote/backup1".into()]);
        let report = d.dispatch(&job, Path::new("/other/a.txt")).await;
        assert_eq!(report, DispatchReport::default());
        assert!(d.queue().is_empty());
    }
}
