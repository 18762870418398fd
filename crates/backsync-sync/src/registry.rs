//! Watch registry
//!
//! Single source of truth for what is being watched: a concurrent map from
//! source directory to the active state of its job. Activation and
//! deactivation go through the registry, which owns subscribing the event
//! watcher or starting and stopping a job's poll timer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use backsync_core::domain::{BackupJob, JobId, WatchMode};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::guard::{FlightGuard, SingleFlight};
use crate::matcher::IgnoreMatcher;
use crate::scheduler::{PollScheduler, PollTask};
use crate::watcher::EventWatcher;
use crate::SyncError;

// ============================================================================
// ActiveJob
// ============================================================================

/// In-memory counterpart of an enabled job
///
/// The source directory, mode and ignore matcher are fixed for the lifetime
/// of an activation; changing them means deactivating and activating again.
/// Destinations can be patched in place.
#[derive(Debug)]
pub struct ActiveJob {
    id: JobId,
    src: PathBuf,
    mode: WatchMode,
    matcher: Arc<IgnoreMatcher>,
    job: RwLock<BackupJob>,
    poll_flight: SingleFlight,
}

impl ActiveJob {
    /// Compiles the job's ignore patterns
    pub fn new(job: BackupJob) -> Result<Self, SyncError> {
        let matcher = IgnoreMatcher::new(&job.src, &job.ignore)?;
        Ok(Self {
            id: job.id,
            src: job.src.clone(),
            mode: job.mode,
            matcher: Arc::new(matcher),
            job: RwLock::new(job),
            poll_flight: SingleFlight::new(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn src(&self) -> &Path {
        &self.src
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    pub fn matcher(&self) -> &Arc<IgnoreMatcher> {
        &self.matcher
    }

    /// Snapshot of the current configuration
    pub fn job(&self) -> BackupJob {
        self.job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dst
            .clone()
    }

    fn set_destinations(&self, dst: Vec<String>) {
        self.job.write().unwrap_or_else(PoisonError::into_inner).dst = dst;
    }

    /// Claims the job's poll slot; `None` while a cycle is already running
    pub fn try_begin_poll(&self) -> Option<FlightGuard<'_>> {
        self.poll_flight.try_begin()
    }
}

// ============================================================================
// WatchRegistry
// ============================================================================

struct WatchState {
    active: Arc<ActiveJob>,
    poll: Option<PollTask>,
}

/// Concurrent map of source directory to active job
pub struct WatchRegistry {
    entries: DashMap<PathBuf, WatchState>,
    watcher: Arc<EventWatcher>,
    scheduler: Arc<PollScheduler>,
}

impl WatchRegistry {
    pub fn new(watcher: Arc<EventWatcher>, scheduler: Arc<PollScheduler>) -> Self {
        Self {
            entries: DashMap::new(),
            watcher,
            scheduler,
        }
    }

    /// Starts watching `job.src`
    ///
    /// Event jobs get their source tree subscribed; polling jobs get a timer
    /// whose first cycle runs immediately.
    ///
    /// # Errors
    ///
    /// - `SyncError::PathNotFound` / `SyncError::NotADirectory` if the source
    ///   is not an accessible directory
    /// - `SyncError::AlreadyWatched` if another job holds the same source
    /// - `SyncError::InvalidPattern` if an ignore pattern does not compile
    pub async fn activate(&self, job: BackupJob) -> Result<Arc<ActiveJob>, SyncError> {
        let src = job.src.clone();
        let metadata = tokio::fs::metadata(&src).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::PathNotFound(src.clone()),
            _ => SyncError::IoError(e),
        })?;
        if !metadata.is_dir() {
            return Err(SyncError::NotADirectory(src));
        }

        let active = Arc::new(ActiveJob::new(job)?);

        match self.entries.entry(src.clone()) {
            Entry::Occupied(_) => return Err(SyncError::AlreadyWatched(src)),
            Entry::Vacant(slot) => {
                let poll = (active.mode() == WatchMode::Polling)
                    .then(|| self.scheduler.start(Arc::clone(&active)));
                slot.insert(WatchState {
                    active: Arc::clone(&active),
                    poll,
                });
            }
        }

        if active.mode() == WatchMode::Event {
            let watcher = Arc::clone(&self.watcher);
            let matcher = Arc::clone(active.matcher());
            let root = src.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || {
                watcher.subscribe_tree(&root, &root, &matcher)
            })
            .await
            {
                warn!(src = %src.display(), error = %e, "Subscription walk aborted");
            }
        }

        info!(
            job_id = %active.id(),
            src = %src.display(),
            mode = %active.mode(),
            "Watch activated"
        );
        Ok(active)
    }

    /// Stops watching `src`; returns false if it was not watched
    ///
    /// A polling job's timer is stopped (and any running cycle abandoned)
    /// while the entry still holds `src`, so a concurrent activation of the
    /// same source fails with `AlreadyWatched` until the old timer is gone.
    pub async fn deactivate(&self, src: &Path) -> bool {
        let poll = match self.entries.get_mut(src) {
            Some(mut state) => state.poll.take(),
            None => {
                debug!(src = %src.display(), "Nothing to deactivate");
                return false;
            }
        };
        if let Some(poll) = poll {
            poll.stop().await;
        }

        let Some((_, state)) = self.entries.remove(src) else {
            debug!(src = %src.display(), "Deactivated concurrently");
            return false;
        };
        if state.active.mode() == WatchMode::Event {
            self.watcher.unsubscribe_tree(src);
        }
        self.scheduler.release(src).await;

        info!(job_id = %state.active.id(), src = %src.display(), "Watch deactivated");
        true
    }

    pub fn lookup(&self, src: &Path) -> Option<Arc<ActiveJob>> {
        self.entries.get(src).map(|state| Arc::clone(&state.active))
    }

    /// The active job whose source is the longest prefix of `path`
    pub fn find_owner(&self, path: &Path) -> Option<Arc<ActiveJob>> {
        self.entries
            .iter()
            .filter(|entry| path.starts_with(entry.key()))
            .max_by_key(|entry| entry.key().components().count())
            .map(|entry| Arc::clone(&entry.active))
    }

    pub fn snapshot_all(&self) -> Vec<Arc<ActiveJob>> {
        let mut all: Vec<Arc<ActiveJob>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.active))
            .collect();
        all.sort_by(|a, b| a.src().cmp(b.src()));
        all
    }

    /// Replaces the destinations of a live job without touching its
    /// subscriptions or timer
    pub fn patch_destinations(&self, src: &Path, dst: Vec<String>) -> bool {
        match self.entries.get(src) {
            Some(state) => {
                state.active.set_destinations(dst);
                debug!(src = %src.display(), "Destinations patched");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, src: &Path) -> bool {
        self.entries.contains_key(src)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deactivates every job
    pub async fn clear(&self) {
        let srcs: Vec<PathBuf> = self.entries.iter().map(|e| e.key().clone()).collect();
        for src in srcs {
            self.deactivate(&src).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use backsync_core::ports::{
        FileStream, IPathResolver, IUploader, ProgressFn, ResolveError, ResolvedTarget,
        StorageHandle,
    };

    use super::*;
    use crate::dispatcher::UploadDispatcher;
    use crate::manifest::SidecarManifest;
    use crate::queue::{QueueConfig, TaskQueue};
    use crate::watcher::DirectoryNotifier;

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        watched: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl DirectoryNotifier for RecordingNotifier {
        fn watch(&mut self, dir: &Path) -> Result<(), SyncError> {
            self.watched.lock().unwrap().push(dir.to_path_buf());
            Ok(())
        }

        fn unwatch(&mut self, dir: &Path) -> Result<(), SyncError> {
            self.watched.lock().unwrap().retain(|d| d != dir);
            Ok(())
        }
    }

    struct AnyResolver;

    impl IPathResolver for AnyResolver {
        fn resolve(&self, path: &str) -> Result<ResolvedTarget, ResolveError> {
            Ok(ResolvedTarget {
                storage: StorageHandle {
                    mount_path: "/".to_string(),
                    no_upload: false,
                },
                actual_path: path.to_string(),
            })
        }
    }

    struct NullUploader;

    #[async_trait::async_trait]
    impl IUploader for NullUploader {
        async fn put(
            &self,
            _target: &ResolvedTarget,
            _stream: FileStream,
            _progress: &ProgressFn<'_>,
            _overwrite: bool,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> (WatchRegistry, RecordingNotifier) {
        let resolver: Arc<dyn IPathResolver> = Arc::new(AnyResolver);
        let queue = Arc::new(TaskQueue::new(
            QueueConfig {
                workers: 1,
                max_retry: 0,
                retry_delay: Duration::ZERO,
                persist_path: None,
                persist_debounce: Duration::from_secs(1),
                keep_succeeded: 64,
            },
            Arc::clone(&resolver),
            Arc::new(NullUploader),
        ));
        let dispatcher = Arc::new(UploadDispatcher::new(resolver, queue, Duration::ZERO));
        let scheduler = Arc::new(PollScheduler::new(dispatcher, Arc::new(SidecarManifest::new())));
        let notifier = RecordingNotifier::default();
        let watcher = Arc::new(EventWatcher::new(Box::new(notifier.clone())));
        (WatchRegistry::new(watcher, scheduler), notifier)
    }

    fn job(src: &Path, mode: WatchMode) -> BackupJob {
        BackupJob::new(src, vec!["/remote".to_string()]).with_mode(mode, 1)
    }

    #[tokio::test]
    async fn test_activate_event_job_subscribes_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (registry, notifier) = registry();

        registry.activate(job(dir.path(), WatchMode::Event)).await.unwrap();

        assert!(registry.contains(dir.path()));
        assert_eq!(notifier.watched.lock().unwrap().len(), 2);

        assert!(registry.deactivate(dir.path()).await);
        assert!(notifier.watched.lock().unwrap().is_empty());
        assert!(registry.lookup(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_activate_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry();

        registry.activate(job(dir.path(), WatchMode::Event)).await.unwrap();
        let err = registry
            .activate(job(dir.path(), WatchMode::Polling))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyWatched(_)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(dir.path()).unwrap().mode(), WatchMode::Event);
    }

    #[tokio::test]
    async fn test_activate_rejects_missing_and_file_sources() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        let (registry, _) = registry();

        let err = registry
            .activate(job(&dir.path().join("missing"), WatchMode::Event))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PathNotFound(_)));

        let err = registry.activate(job(&file, WatchMode::Event)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotADirectory(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_nested_event_jobs_keep_each_others_subscriptions() {
        let outer = tempfile::tempdir().unwrap();
        let inner = outer.path().join("inner");
        std::fs::create_dir_all(inner.join("deep")).unwrap();
        let (registry, notifier) = registry();

        registry.activate(job(outer.path(), WatchMode::Event)).await.unwrap();
        registry.activate(job(&inner, WatchMode::Event)).await.unwrap();
        assert_eq!(notifier.watched.lock().unwrap().len(), 3);

        assert!(registry.deactivate(&inner).await);
        assert_eq!(notifier.watched.lock().unwrap().len(), 3);

        registry.activate(job(&inner, WatchMode::Event)).await.unwrap();
        assert!(registry.deactivate(outer.path()).await);
        assert_eq!(
            *notifier.watched.lock().unwrap(),
            vec![inner.clone(), inner.join("deep")]
        );
    }

    #[tokio::test]
    async fn test_polling_entry_is_held_until_timer_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry();
        registry.activate(job(dir.path(), WatchMode::Polling)).await.unwrap();

        // deactivate is first polled up to the timer join, then the source
        // is checked while the timer is still winding down
        let (stopped, held) = tokio::join!(registry.deactivate(dir.path()), async {
            registry.contains(dir.path())
        });
        assert!(stopped);
        assert!(held);
        assert!(!registry.contains(dir.path()));
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry();
        registry.activate(job(dir.path(), WatchMode::Polling)).await.unwrap();

        assert!(registry.deactivate(dir.path()).await);
        assert!(!registry.deactivate(dir.path()).await);
    }

    #[tokio::test]
    async fn test_find_owner_prefers_longest_prefix() {
        let outer = tempfile::tempdir().unwrap();
        let inner = outer.path().join("inner");
        std::fs::create_dir(&inner).unwrap();
        let (registry, _) = registry();

        registry.activate(job(outer.path(), WatchMode::Event)).await.unwrap();
        registry.activate(job(&inner, WatchMode::Event)).await.unwrap();

        let owner = registry.find_owner(&inner.join("a.txt")).unwrap();
        assert_eq!(owner.src(), inner.as_path());
        let owner = registry.find_owner(&outer.path().join("b.txt")).unwrap();
        assert_eq!(owner.src(), outer.path());
        assert!(registry.find_owner(Path::new("/definitely/elsewhere")).is_none());
        assert_eq!(registry.snapshot_all().len(), 2);
    }

    #[tokio::test]
    async fn test_patch_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry();
        registry.activate(job(dir.path(), WatchMode::Event)).await.unwrap();

        assert!(registry.patch_destinations(dir.path(), vec!["/other".to_string()]));
        let active = registry.lookup(dir.path()).unwrap();
        assert_eq!(active.destinations(), vec!["/other".to_string()]);
        assert!(!registry.patch_destinations(Path::new("/nope"), vec![]));
    }
}
