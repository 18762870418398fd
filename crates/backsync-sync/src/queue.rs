//! Upload task queue
//!
//! Executes "upload this file to this destination" tasks on a bounded pool,
//! with:
//!
//! - **Deduplication**: a task id is a hash of `(file, destination dir)`;
//!   submitting an id that is pending, running or retrying is a no-op
//! - **Retry**: each task gets `max_retry` retries after its first attempt,
//!   then stays listed as [`TaskState::Failed`] until retried by hand
//! - **Bounded history**: only the newest `keep_succeeded` succeeded tasks
//!   stay listed
//! - **Fresh handles**: the source file is reopened on every attempt
//! - **Durability**: outstanding tasks are written to a JSON file at most
//!   once per debounce interval and on shutdown, and reloaded at startup
//!
//! ```text
//!  submit() ──► tasks: DashMap ──► spawn ──► semaphore permit ──► attempt()
//!                    │                                               │
//!                    └──── dirty ──► persister (debounced JSON) ◄────┘
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backsync_core::config::TasksConfig;
use backsync_core::domain::JobId;
use backsync_core::ports::{FileStream, IPathResolver, IUploader};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause between two attempts of the same task
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Task types
// ============================================================================

/// Deterministic identifier of an upload task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Hex SHA-256 of the source path and the destination directory
    pub fn for_upload(source_file: &Path, destination: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_file.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of upload work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: TaskId,
    /// Job that produced the task
    pub job_id: JobId,
    /// Absolute local path
    pub source_file: PathBuf,
    /// Destination directory in the virtual remote namespace
    pub destination: String,
}

impl UploadTask {
    pub fn new(job_id: JobId, source_file: PathBuf, destination: String) -> Self {
        Self {
            id: TaskId::for_upload(&source_file, &destination),
            job_id,
            source_file,
            destination,
        }
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskState {
    /// Pending, running and retrying tasks block resubmission of their id
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Pending | TaskState::Running | TaskState::Retrying
        )
    }
}

/// Observable state of a submitted task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task: UploadTask,
    pub state: TaskState,
    /// Attempts started so far
    pub attempts: u32,
    /// Last reported progress, in percent
    pub progress: f64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInfo {
    fn new(task: UploadTask) -> Self {
        let now = Utc::now();
        Self {
            task,
            state: TaskState::Pending,
            attempts: 0,
            progress: 0.0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Tuning of the queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum concurrent uploads
    pub workers: usize,
    /// Retries after the first failed attempt
    pub max_retry: u32,
    pub retry_delay: Duration,
    /// JSON file holding outstanding tasks; `None` disables persistence
    pub persist_path: Option<PathBuf>,
    pub persist_debounce: Duration,
    /// Succeeded tasks kept listed before the oldest are dropped
    pub keep_succeeded: usize,
}

impl QueueConfig {
    pub fn from_config(tasks: &TasksConfig) -> Self {
        Self {
            workers: tasks.workers.max(1),
            max_retry: tasks.max_retry,
            retry_delay: DEFAULT_RETRY_DELAY,
            persist_path: tasks.persist_path.clone(),
            persist_debounce: Duration::from_secs(tasks.persist_debounce_secs),
            keep_succeeded: tasks.keep_succeeded,
        }
    }
}

// ============================================================================
// TaskQueue
// ============================================================================

/// Bounded, retrying, deduplicating upload queue
///
/// Must be created inside a Tokio runtime.
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    resolver: Arc<dyn IPathResolver>,
    uploader: Arc<dyn IUploader>,
    tasks: DashMap<TaskId, TaskInfo>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    dirty: AtomicBool,
    persist_signal: Notify,
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        resolver: Arc<dyn IPathResolver>,
        uploader: Arc<dyn IUploader>,
    ) -> Self {
        info!(
            workers = config.workers,
            max_retry = config.max_retry,
            persist = ?config.persist_path,
            "Creating upload task queue"
        );

        let inner = Arc::new(QueueInner {
            semaphore: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            resolver,
            uploader,
            tasks: DashMap::new(),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            dirty: AtomicBool::new(false),
            persist_signal: Notify::new(),
        });

        if inner.config.persist_path.is_some() {
            inner.tracker.spawn(persist_loop(Arc::clone(&inner)));
        }

        Self { inner }
    }

    /// Enqueues `task`; returns false if its id is already outstanding
    ///
    /// A task whose previous run finished (succeeded or failed) is replaced
    /// by a fresh run.
    pub fn submit(&self, task: UploadTask) -> bool {
        if self.inner.cancel.is_cancelled() {
            warn!(task_id = %task.id, "Task queue is shut down, dropping task");
            return false;
        }

        let id = task.id.clone();
        match self.inner.tasks.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state.is_active() {
                    debug!(task_id = %id, "Task already queued");
                    return false;
                }
                entry.insert(TaskInfo::new(task));
            }
            Entry::Vacant(entry) => {
                entry.insert(TaskInfo::new(task));
            }
        }

        self.spawn(id);
        true
    }

    /// Resubmits a failed task with a fresh retry budget
    pub fn retry_failed(&self, id: &TaskId) -> bool {
        let reset = match self.inner.tasks.get_mut(id) {
            Some(mut info) if info.state == TaskState::Failed => {
                info.state = TaskState::Pending;
                info.attempts = 0;
                info.progress = 0.0;
                info.last_error = None;
                info.updated_at = Utc::now();
                true
            }
            _ => false,
        };
        if reset {
            info!(task_id = %id, "Retrying failed task");
            self.spawn(id.clone());
        }
        reset
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskInfo> {
        self.inner.tasks.get(id).map(|info| info.clone())
    }

    /// All known tasks, oldest first
    pub fn list(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task.id.cmp(&b.task.id)));
        tasks
    }

    /// Number of pending, running or retrying tasks
    pub fn len_active(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| entry.state.is_active())
            .count()
    }

    /// Number of listed tasks, failed and retained succeeded ones included
    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    /// Waits until no task is outstanding (or the queue is shut down)
    pub async fn wait_idle(&self) {
        while self.len_active() > 0 && !self.inner.cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Reloads tasks persisted by a previous run and submits them
    pub async fn load_persisted(&self) -> anyhow::Result<usize> {
        let Some(path) = self.inner.config.persist_path.clone() else {
            return Ok(0);
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read task file {}", path.display()))
            }
        };
        let tasks: Vec<UploadTask> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse task file {}", path.display()))?;

        let restored = tasks.into_iter().filter(|t| self.submit(t.clone())).count();
        info!(restored, path = %path.display(), "Restored pending upload tasks");
        Ok(restored)
    }

    /// Stops all workers and writes outstanding tasks to disk
    ///
    /// Attempts in flight are abandoned and stay outstanding, so they are
    /// persisted and rerun after a restart.
    pub async fn shutdown(&self) {
        info!(active = self.len_active(), "Shutting down task queue");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        if let Err(e) = self.inner.persist().await {
            warn!(error = %e, "Failed to persist pending tasks");
        }
    }

    fn spawn(&self, id: TaskId) {
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(run_task(inner, id));
        self.inner.mark_dirty();
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl QueueInner {
    fn update<R>(&self, id: &TaskId, f: impl FnOnce(&mut TaskInfo) -> R) -> Option<R> {
        self.tasks.get_mut(id).map(|mut info| {
            info.updated_at = Utc::now();
            f(&mut info)
        })
    }

    fn mark_dirty(&self) {
        if self.config.persist_path.is_some() {
            self.dirty.store(true, Ordering::Release);
            self.persist_signal.notify_one();
        }
    }

    /// Forgets the oldest succeeded tasks beyond `keep_succeeded`
    fn prune_succeeded(&self) {
        let mut succeeded: Vec<(DateTime<Utc>, TaskId)> = self
            .tasks
            .iter()
            .filter(|entry| entry.state == TaskState::Succeeded)
            .map(|entry| (entry.updated_at, entry.key().clone()))
            .collect();
        if succeeded.len() <= self.config.keep_succeeded {
            return;
        }

        succeeded.sort();
        let excess = succeeded.len() - self.config.keep_succeeded;
        let pruned = succeeded
            .into_iter()
            .take(excess)
            .filter(|(_, id)| {
                self.tasks
                    .remove_if(id, |_, info| info.state == TaskState::Succeeded)
                    .is_some()
            })
            .count();
        debug!(pruned, "Pruned succeeded tasks");
    }

    async fn attempt(&self, task: &UploadTask) -> anyhow::Result<()> {
        let target = self.resolver.resolve(&task.destination)?;
        if target.storage.no_upload {
            anyhow::bail!(
                "storage mounted at {} does not accept uploads",
                target.storage.mount_path
            );
        }

        let path = task.source_file.clone();
        let stream = tokio::task::spawn_blocking(move || FileStream::open(&path))
            .await?
            .with_context(|| format!("Failed to open {}", task.source_file.display()))?;

        let tasks = &self.tasks;
        let id = &task.id;
        let progress = move |percent: f64| {
            if let Some(mut info) = tasks.get_mut(id) {
                info.progress = percent;
            }
        };

        self.uploader.put(&target, stream, &progress, true).await
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.config.persist_path else {
            return Ok(());
        };

        let mut pending: Vec<(DateTime<Utc>, UploadTask)> = self
            .tasks
            .iter()
            .filter(|entry| entry.state.is_active())
            .map(|entry| (entry.created_at, entry.task.clone()))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        let pending: Vec<UploadTask> = pending.into_iter().map(|(_, t)| t).collect();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(&pending)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(count = pending.len(), path = %path.display(), "Persisted pending tasks");
        Ok(())
    }
}

// ============================================================================
// Background loops
// ============================================================================

async fn run_task(inner: Arc<QueueInner>, id: TaskId) {
    let _permit = tokio::select! {
        _ = inner.cancel.cancelled() => return,
        permit = Arc::clone(&inner.semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let Some(task) = inner.tasks.get(&id).map(|info| info.task.clone()) else {
        return;
    };
    let max_attempts = inner.config.max_retry.saturating_add(1);

    loop {
        let attempt = inner
            .update(&id, |info| {
                info.state = TaskState::Running;
                info.attempts += 1;
                info.attempts
            })
            .unwrap_or(1);

        let result = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            result = inner.attempt(&task) => result,
        };

        match result {
            Ok(()) => {
                inner.update(&id, |info| {
                    info.state = TaskState::Succeeded;
                    info.progress = 100.0;
                    info.last_error = None;
                });
                info!(
                    task_id = %id,
                    file = %task.source_file.display(),
                    destination = %task.destination,
                    attempt,
                    "Upload completed"
                );
                inner.prune_succeeded();
                inner.mark_dirty();
                return;
            }
            Err(e) if attempt >= max_attempts => {
                let message = format!("{e:#}");
                error!(
                    task_id = %id,
                    file = %task.source_file.display(),
                    destination = %task.destination,
                    attempts = attempt,
                    error = %message,
                    "Upload failed, giving up"
                );
                inner.update(&id, |info| {
                    info.state = TaskState::Failed;
                    info.last_error = Some(message);
                });
                inner.mark_dirty();
                return;
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(
                    task_id = %id,
                    file = %task.source_file.display(),
                    destination = %task.destination,
                    attempt,
                    error = %message,
                    "Upload attempt failed, retrying"
                );
                inner.update(&id, |info| {
                    info.state = TaskState::Retrying;
                    info.last_error = Some(message);
                });
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(inner.config.retry_delay) => {}
                }
            }
        }
    }
}

async fn persist_loop(inner: Arc<QueueInner>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = inner.persist_signal.notified() => {}
        }
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.persist_debounce) => {}
        }
        if inner.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = inner.persist().await {
                warn!(error = %e, "Failed to persist pending tasks");
            }
        }
    }
}
