//! Backup service
//!
//! The [`BackupService`] owns the job lifecycle and ties the components
//! together:
//!
//! ```text
//!  create / update / delete ──→ IRecordStore
//!            │
//!            ▼
//!      WatchRegistry ──→ EventWatcher (event jobs)
//!            │       └─→ PollScheduler (polling jobs)
//!            ▼
//!  run_events(rx) ──→ handle_event ──→ UploadDispatcher ──→ TaskQueue
//! ```
//!
//! ## Lifecycle
//!
//! - **Create**: validate, persist, activate; an event job with
//!   `init_upload` then uploads its existing files once in the background.
//!   If activation fails the stored record is removed again.
//! - **Update**: persist, then reconcile the live watch with the new record
//!   (disable, enable, rebuild, or patch destinations in place).
//! - **Delete**: deactivate, then remove the stored record.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use backsync_core::config::Config;
use backsync_core::domain::{BackupJob, JobId, WatchMode};
use backsync_core::ports::{IPathResolver, IRecordStore};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchReport, UploadDispatcher};
use crate::guard::SingleFlight;
use crate::manifest::{is_manifest_file, ManifestStore};
use crate::matcher::IgnoreMatcher;
use crate::queue::TaskQueue;
use crate::registry::{ActiveJob, WatchRegistry};
use crate::scheduler::{PollOutcome, PollScheduler};
use crate::watcher::{ChangeEvent, DirectoryNotifier, EventWatcher};
use crate::SyncError;

// ============================================================================
// Outcomes
// ============================================================================

/// What [`BackupService::handle_event`] did with one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// No event job owns the path, the path is ignored or gone
    Dropped,
    /// A new directory was subscribed (with this many directories)
    Subscribed(usize),
    /// The file's modification time matches the manifest
    Unchanged,
    /// The file was fanned out to its destinations
    Dispatched(DispatchReport),
}

/// Result of [`BackupService::run_all`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A previous run was still in progress
    Skipped,
    Completed {
        /// Jobs reconciled in this run
        jobs: usize,
        /// Jobs whose own cycle was already running
        busy: usize,
        /// Files found changed across all jobs
        changed: usize,
        /// Upload tasks accepted by the queue
        submitted: usize,
    },
}

// ============================================================================
// BackupService
// ============================================================================

pub struct BackupService {
    /// Identity of this node; jobs of other nodes are never touched
    server_id: String,
    /// Polling interval applied to polling jobs that leave it unset
    default_polling_minutes: u64,
    store: Arc<dyn IRecordStore>,
    resolver: Arc<dyn IPathResolver>,
    registry: Arc<WatchRegistry>,
    watcher: Arc<EventWatcher>,
    dispatcher: Arc<UploadDispatcher>,
    manifest: Arc<dyn ManifestStore>,
    scheduler: Arc<PollScheduler>,
    /// Event handlers and initial uploads
    background: TaskTracker,
    run_flight: SingleFlight,
}

impl BackupService {
    /// Wires the engine components together
    ///
    /// # Arguments
    /// * `config` - Node identity, polling default and dispatch pause
    /// * `store` - Persistent jobs (and timestamps for the record manifest)
    /// * `resolver` - Destination to storage mapping
    /// * `queue` - Upload task queue shared with the dispatcher
    /// * `manifest` - Last-seen modification times
    /// * `notifier` - Per-directory change notifier feeding [`Self::run_events`]
    pub fn new(
        config: &Config,
        store: Arc<dyn IRecordStore>,
        resolver: Arc<dyn IPathResolver>,
        queue: Arc<TaskQueue>,
        manifest: Arc<dyn ManifestStore>,
        notifier: Box<dyn DirectoryNotifier>,
    ) -> Self {
        let watcher = Arc::new(EventWatcher::new(notifier));
        let dispatcher = Arc::new(UploadDispatcher::new(
            Arc::clone(&resolver),
            queue,
            Duration::from_millis(config.backup.destination_pause_ms),
        ));
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&dispatcher),
            Arc::clone(&manifest),
        ));
        let registry = Arc::new(WatchRegistry::new(
            Arc::clone(&watcher),
            Arc::clone(&scheduler),
        ));

        Self {
            server_id: config.node.server_id.trim().to_string(),
            default_polling_minutes: config.backup.default_polling_interval_minutes,
            store,
            resolver,
            registry,
            watcher,
            dispatcher,
            manifest,
            scheduler,
            background: TaskTracker::new(),
            run_flight: SingleFlight::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        self.dispatcher.queue()
    }

    /// Returns true while a [`Self::run_all`] is in progress
    pub fn is_running(&self) -> bool {
        self.run_flight.is_running()
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Normalizes `job`, applies defaults and checks every configuration
    /// invariant that does not involve other jobs
    fn prepare(&self, job: &mut BackupJob) -> Result<(), SyncError> {
        if self.server_id.is_empty() {
            return Err(SyncError::ServerIdNotSet);
        }
        job.server_id = self.server_id.clone();
        job.normalize();
        job.apply_defaults(self.default_polling_minutes);
        job.check_invariants()?;

        match std::fs::metadata(&job.src) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(SyncError::NotADirectory(job.src.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::PathNotFound(job.src.clone()))
            }
            Err(e) => return Err(SyncError::IoError(e)),
        }

        for dst in &job.dst {
            let target = self.resolver.resolve(dst)?;
            if target.storage.no_upload {
                return Err(SyncError::UploadNotSupported(target.storage.mount_path));
            }
        }

        IgnoreMatcher::new(&job.src, &job.ignore)?;
        Ok(())
    }

    /// Checks `job` without storing or activating it
    ///
    /// # Errors
    ///
    /// - `SyncError::ServerIdNotSet` if this node has no server id
    /// - `SyncError::DomainError` for a relative source, no destination or
    ///   a zero polling interval
    /// - `SyncError::PathNotFound` / `SyncError::NotADirectory` for the source
    /// - `SyncError::Resolve` / `SyncError::UploadNotSupported` for a destination
    /// - `SyncError::InvalidPattern` for an ignore pattern
    pub fn validate_backup_job(&self, job: &BackupJob) -> Result<(), SyncError> {
        let mut job = job.clone();
        self.prepare(&mut job)
    }

    /// Rejects `job` if another stored job of this node (enabled or not)
    /// has the same source
    async fn ensure_unique_src(&self, job: &BackupJob) -> Result<(), SyncError> {
        let jobs = self
            .store
            .list_jobs_for_node(&self.server_id)
            .await
            .map_err(SyncError::Store)?;
        if jobs.iter().any(|other| other.id != job.id && other.src == job.src) {
            return Err(SyncError::AlreadyWatched(job.src.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // Job lifecycle
    // ========================================================================

    /// Validates, stores and activates a new job
    ///
    /// # Returns
    /// The id assigned by the record store
    pub async fn create_backup_job(&self, mut job: BackupJob) -> Result<JobId, SyncError> {
        job.id = JobId::unassigned();
        self.prepare(&mut job)?;
        self.ensure_unique_src(&job).await?;

        let now = Utc::now();
        job.created_at = now;
        job.updated_at = now;
        job.id = self.store.create_job(&job).await.map_err(SyncError::Store)?;

        info!(job_id = %job.id, src = %job.src.display(), mode = %job.mode, "Backup job created");

        if job.disabled {
            return Ok(job.id);
        }

        let active = match self.registry.activate(job.clone()).await {
            Ok(active) => active,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Activation failed, removing stored job");
                if let Err(del) = self.store.delete_job(job.id).await {
                    warn!(job_id = %job.id, error = %del, "Failed to roll back job creation");
                }
                return Err(e);
            }
        };

        if job.init_upload && job.is_event_mode() {
            let scheduler = Arc::clone(&self.scheduler);
            self.background.spawn(async move {
                scheduler.upload_existing(&active).await;
            });
        }

        Ok(job.id)
    }

    /// Stores a changed job and brings its live watch in line with it
    ///
    /// # Errors
    ///
    /// `SyncError::JobNotFound` if no job with `job.id` exists, plus the
    /// validation errors of [`Self::validate_backup_job`].
    pub async fn update_backup_job(&self, mut job: BackupJob) -> Result<(), SyncError> {
        let prior = self
            .store
            .get_job(job.id)
            .await
            .map_err(SyncError::Store)?
            .filter(|prior| prior.server_id == self.server_id)
            .ok_or(SyncError::JobNotFound(job.id))?;

        self.prepare(&mut job)?;
        self.ensure_unique_src(&job).await?;
        job.created_at = prior.created_at;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await.map_err(SyncError::Store)?;

        let was_active = self.registry.contains(&prior.src);
        if job.disabled {
            if was_active {
                self.registry.deactivate(&prior.src).await;
            }
        } else if !was_active {
            self.registry.activate(job.clone()).await?;
        } else if needs_rebuild(&prior, &job) {
            self.registry.deactivate(&prior.src).await;
            self.registry.activate(job.clone()).await?;
        } else if prior.dst != job.dst {
            self.registry.patch_destinations(&job.src, job.dst.clone());
        }

        info!(job_id = %job.id, src = %job.src.display(), disabled = job.disabled, "Backup job updated");
        Ok(())
    }

    /// Stops watching and removes a job
    pub async fn delete_backup_job(&self, id: JobId) -> Result<(), SyncError> {
        let job = self.get_backup_job(id).await?;
        self.registry.deactivate(&job.src).await;
        self.store.delete_job(id).await.map_err(SyncError::Store)?;
        info!(job_id = %id, src = %job.src.display(), "Backup job deleted");
        Ok(())
    }

    pub async fn get_backup_job(&self, id: JobId) -> Result<BackupJob, SyncError> {
        self.store
            .get_job(id)
            .await
            .map_err(SyncError::Store)?
            .filter(|job| job.server_id == self.server_id)
            .ok_or(SyncError::JobNotFound(id))
    }

    /// One page (1-based) of this node's jobs and the total count
    pub async fn list_backup_jobs(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<BackupJob>, u64), SyncError> {
        self.store
            .list_jobs(&self.server_id, page.max(1), per_page.max(1))
            .await
            .map_err(SyncError::Store)
    }

    /// Activates every enabled stored job of this node
    ///
    /// A job that cannot be activated is logged and left inactive.
    /// Returns the number of jobs activated.
    pub async fn init(&self) -> Result<usize, SyncError> {
        if self.server_id.is_empty() {
            return Err(SyncError::ServerIdNotSet);
        }
        let jobs = self
            .store
            .list_jobs_for_node(&self.server_id)
            .await
            .map_err(SyncError::Store)?;

        let mut activated = 0;
        for job in jobs.into_iter().filter(|job| !job.disabled) {
            let (id, src) = (job.id, job.src.clone());
            match self.registry.activate(job).await {
                Ok(_) => activated += 1,
                Err(e) => warn!(job_id = %id, src = %src.display(), error = %e, "Cannot activate job"),
            }
        }

        info!(server_id = %self.server_id, activated, "Backup jobs restored");
        Ok(activated)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Processes one filesystem event
    pub async fn handle_event(&self, event: ChangeEvent) -> EventOutcome {
        let path = event.path();
        let Some(active) = self
            .registry
            .find_owner(path)
            .filter(|active| active.mode() == WatchMode::Event)
        else {
            debug!(path = %path.display(), "No event job owns path");
            return EventOutcome::Dropped;
        };
        if is_manifest_file(path) {
            return EventOutcome::Dropped;
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Path vanished before handling");
                return EventOutcome::Dropped;
            }
        };

        if active.matcher().is_ignored(path, metadata.is_dir()) {
            debug!(path = %path.display(), "Ignored path");
            return EventOutcome::Dropped;
        }

        if metadata.is_dir() {
            if !event.is_create() {
                return EventOutcome::Dropped;
            }
            return EventOutcome::Subscribed(self.subscribe_new_dir(&active, path).await);
        }
        if !metadata.is_file() {
            return EventOutcome::Dropped;
        }

        let modified = match metadata.modified() {
            Ok(mtime) => DateTime::<Utc>::from(mtime),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read modification time");
                return EventOutcome::Dropped;
            }
        };
        if !self.manifest.is_modified(path, modified).await {
            debug!(path = %path.display(), "File unchanged since last backup");
            return EventOutcome::Unchanged;
        }

        self.manifest.set(path, modified).await;
        let report = self.dispatcher.dispatch(&active.job(), path).await;
        if let Some(parent) = path.parent() {
            self.manifest.flush(parent).await;
        }
        EventOutcome::Dispatched(report)
    }

    async fn subscribe_new_dir(&self, active: &ActiveJob, dir: &Path) -> usize {
        let watcher = Arc::clone(&self.watcher);
        let matcher = Arc::clone(active.matcher());
        let owner = active.src().to_path_buf();
        let root = dir.to_path_buf();
        match tokio::task::spawn_blocking(move || watcher.subscribe_tree(&owner, &root, &matcher))
            .await
        {
            Ok(added) => added,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Subscription walk aborted");
                0
            }
        }
    }

    /// Consumes notifier events until `cancel` fires or the channel closes
    ///
    /// Every event is handled on its own task.
    pub async fn run_events(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<ChangeEvent>,
        cancel: CancellationToken,
    ) {
        info!("Event loop started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let service = Arc::clone(&self);
            self.background.spawn(async move {
                service.handle_event(event).await;
            });
        }
        info!("Event loop stopped");
    }

    // ========================================================================
    // Run-all
    // ========================================================================

    /// Runs one reconciliation cycle over every active job
    ///
    /// Skipped entirely while a previous run is still going.
    pub async fn run_all(&self) -> RunOutcome {
        let Some(_guard) = self.run_flight.try_begin() else {
            info!("Backup run already in progress, skipping");
            return RunOutcome::Skipped;
        };

        let (mut jobs, mut busy, mut changed, mut submitted) = (0, 0, 0, 0);
        for active in self.registry.snapshot_all() {
            match self.scheduler.poll_once(&active).await {
                PollOutcome::Completed(report) => {
                    jobs += 1;
                    changed += report.changed;
                    submitted += report.dispatch.submitted;
                }
                PollOutcome::Skipped => busy += 1,
            }
        }

        info!(jobs, busy, changed, submitted, "Backup run complete");
        RunOutcome::Completed {
            jobs,
            busy,
            changed,
            submitted,
        }
    }

    /// Stops every watch and waits for in-flight event handlers
    ///
    /// The queue is shut down separately by its owner.
    pub async fn shutdown(&self) {
        self.registry.clear().await;
        self.background.close();
        self.background.wait().await;
        info!("Backup service stopped");
    }

    /// Sources of all active jobs
    pub fn active_sources(&self) -> Vec<PathBuf> {
        self.registry
            .snapshot_all()
            .iter()
            .map(|active| active.src().to_path_buf())
            .collect()
    }
}

/// Changes that invalidate the subscriptions, timer or matcher of a watch
fn needs_rebuild(prior: &BackupJob, next: &BackupJob) -> bool {
    prior.src != next.src
        || prior.mode != next.mode
        || prior.ignore != next.ignore
        || (next.is_polling_mode() && prior.polling_interval_minutes != next.polling_interval_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BackupJob {
        BackupJob::new("/data/docs", vec!["/remote/backup1".to_string()])
            .with_mode(WatchMode::Polling, 5)
    }

    #[test]
    fn test_destination_change_alone_is_patched() {
        let mut next = base();
        next.dst.push("/remote/backup2".to_string());
        assert!(!needs_rebuild(&base(), &next));
    }

    #[test]
    fn test_rebuild_on_mode_ignore_interval_or_src() {
        let prior = base();
        assert!(needs_rebuild(&prior, &base().with_mode(WatchMode::Event, 0)));
        assert!(needs_rebuild(&prior, &base().with_ignore(vec!["*.tmp".into()])));
        assert!(needs_rebuild(&prior, &base().with_mode(WatchMode::Polling, 10)));

        let mut moved = base();
        moved.src = PathBuf::from("/data/other");
        assert!(needs_rebuild(&prior, &moved));
    }

    #[test]
    fn test_interval_is_irrelevant_for_event_jobs() {
        let prior = base().with_mode(WatchMode::Event, 5);
        let next = base().with_mode(WatchMode::Event, 7);
        assert!(!needs_rebuild(&prior, &next));
    }
}
