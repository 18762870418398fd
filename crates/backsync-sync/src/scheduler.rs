//! Poll scheduler
//!
//! Every polling job runs its own timer task. A cycle walks the source tree,
//! compares each file's mtime with the manifest, dispatches the changed
//! files and writes the manifests of every visited directory back.
//!
//! ## Overlap
//!
//! The timer awaits each cycle before waiting for the next tick and skips
//! ticks missed meanwhile, so a slow walk never overlaps itself. A manual
//! [`PollScheduler::poll_once`] racing the timer finds the job's poll slot
//! taken and returns [`PollOutcome::Skipped`].
//!
//! Directories are always descended; there is no directory-mtime shortcut.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchReport, UploadDispatcher};
use crate::manifest::ManifestStore;
use crate::registry::ActiveJob;
use crate::walker::{scan_tree, TreeScan};

/// Lower bound on a timer period
const MIN_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Counts from one reconciliation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Directories visited
    pub directories: usize,
    /// Files compared against the manifest
    pub files: usize,
    /// Files found newer than their manifest entry
    pub changed: usize,
    pub dispatch: DispatchReport,
}

/// Result of asking for a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A cycle for the same job was already running
    Skipped,
    Completed(PollReport),
}

/// Handle to a job's running timer task
pub struct PollTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Stops the timer and waits for its task to end
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Poll task ended abnormally");
            }
        }
    }
}

pub struct PollScheduler {
    dispatcher: Arc<UploadDispatcher>,
    manifest: Arc<dyn ManifestStore>,
}

impl PollScheduler {
    pub fn new(dispatcher: Arc<UploadDispatcher>, manifest: Arc<dyn ManifestStore>) -> Self {
        Self {
            dispatcher,
            manifest,
        }
    }

    /// Spawns the recurring timer for `active`
    ///
    /// The first cycle runs immediately.
    pub fn start(self: &Arc<Self>, active: Arc<ActiveJob>) -> PollTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let scheduler = Arc::clone(self);
        let period = active.job().polling_interval().max(MIN_POLL_PERIOD);

        info!(
            job_id = %active.id(),
            src = %active.src().display(),
            period_secs = period.as_secs(),
            "Starting poll timer"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = scheduler.poll_once(&active) => {}
                }
            }
            debug!(job_id = %active.id(), "Poll timer stopped");
        });

        PollTask { cancel, handle }
    }

    /// Runs one reconciliation cycle unless one is already running
    pub async fn poll_once(&self, active: &ActiveJob) -> PollOutcome {
        let Some(_guard) = active.try_begin_poll() else {
            info!(
                job_id = %active.id(),
                src = %active.src().display(),
                "Poll already in progress, skipping"
            );
            return PollOutcome::Skipped;
        };
        PollOutcome::Completed(self.reconcile(active).await)
    }

    async fn reconcile(&self, active: &ActiveJob) -> PollReport {
        let job = active.job();
        let scan = self.scan(active).await;
        let mut report = PollReport {
            directories: scan.directories.len(),
            files: scan.files.len(),
            ..PollReport::default()
        };

        for dir in &scan.directories {
            self.manifest.touch_dir(dir).await;
        }

        for file in &scan.files {
            if !self.manifest.is_modified(&file.path, file.modified).await {
                continue;
            }
            report.changed += 1;
            let dispatched = self.dispatcher.dispatch(&job, &file.path).await;
            report.dispatch.merge(dispatched);
            self.manifest.set(&file.path, file.modified).await;
        }

        self.manifest.flush(&job.src).await;

        info!(
            job_id = %job.id,
            src = %job.src.display(),
            files = report.files,
            changed = report.changed,
            submitted = report.dispatch.submitted,
            "Poll cycle complete"
        );
        report
    }

    /// Dispatches every non-ignored file once and records its mtime
    ///
    /// Used for the initial upload of a newly created event-mode job.
    pub async fn upload_existing(&self, active: &ActiveJob) -> PollReport {
        let job = active.job();
        let scan = self.scan(active).await;
        let mut report = PollReport {
            directories: scan.directories.len(),
            files: scan.files.len(),
            ..PollReport::default()
        };

        for file in &scan.files {
            report.changed += 1;
            let dispatched = self.dispatcher.dispatch(&job, &file.path).await;
            report.dispatch.merge(dispatched);
            self.manifest.set(&file.path, file.modified).await;
        }
        self.manifest.flush(&job.src).await;

        info!(
            job_id = %job.id,
            src = %job.src.display(),
            files = report.files,
            submitted = report.dispatch.submitted,
            "Initial upload dispatched"
        );
        report
    }

    /// Drops manifest state staged for `src` by a cycle that was cut short
    pub async fn release(&self, src: &Path) {
        self.manifest.discard(src).await;
    }

    async fn scan(&self, active: &ActiveJob) -> TreeScan {
        let root = active.src().to_path_buf();
        let matcher = Arc::clone(active.matcher());
        match tokio::task::spawn_blocking(move || scan_tree(&root, &matcher)).await {
            Ok(scan) => scan,
            Err(e) => {
                warn!(src = %active.src().display(), error = %e, "Tree walk aborted");
                TreeScan::default()
            }
        }
    }
}
