//! Directory subscriptions and filesystem events
//!
//! The OS notifier only reports changes in directories registered one by
//! one, so recursive watching is emulated: the subscribe set of a job is the
//! result of an ignore-aware tree walk of its source, extended whenever a
//! new directory appears.
//!
//! Jobs may be nested, so each subscribed directory records the job sources
//! that claimed it. The notifier is only told to unwatch a directory once
//! its last owner is gone.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  NotifyDirectoryNotifier ──→ mpsc::channel<ChangeEvent> ──→ BackupService
//!       ▲
//!  EventWatcher::subscribe_tree / unsubscribe_tree
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::matcher::IgnoreMatcher;
use crate::walker::scan_tree;
use crate::SyncError;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change relevant to backups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file or directory appeared
    Created(PathBuf),
    /// File content was written
    Written(PathBuf),
}

impl ChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Written(p) => p,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, ChangeEvent::Created(_))
    }
}

/// Converts a `notify::Event` into change events
///
/// Only creations and content writes are kept; removals, renames, metadata
/// changes and access events produce nothing.
pub fn map_notify_event(event: &notify::Event) -> Vec<ChangeEvent> {
    let make: fn(PathBuf) -> ChangeEvent = match &event.kind {
        EventKind::Create(CreateKind::Any | CreateKind::File | CreateKind::Folder) => {
            ChangeEvent::Created
        }
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => ChangeEvent::Written,
        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            return Vec::new();
        }
    };
    event.paths.iter().cloned().map(make).collect()
}

// ============================================================================
// DirectoryNotifier
// ============================================================================

/// Non-recursive, per-directory change notifier
pub trait DirectoryNotifier: Send {
    fn watch(&mut self, dir: &Path) -> Result<(), SyncError>;
    fn unwatch(&mut self, dir: &Path) -> Result<(), SyncError>;
}

/// [`DirectoryNotifier`] backed by the platform watcher from `notify`
pub struct NotifyDirectoryNotifier {
    watcher: RecommendedWatcher,
}

impl NotifyDirectoryNotifier {
    /// Creates the notifier and the channel its events are delivered on
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(capacity: usize) -> Result<(Self, mpsc::Receiver<ChangeEvent>), SyncError> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(capacity.max(1));

        info!(capacity, "Initializing filesystem notifier");

        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for change in map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                            return;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "Filesystem notifier error");
                }
            },
            notify::Config::default(),
        )?;

        Ok((Self { watcher }, rx))
    }
}

impl DirectoryNotifier for NotifyDirectoryNotifier {
    fn watch(&mut self, dir: &Path) -> Result<(), SyncError> {
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unwatch(&mut self, dir: &Path) -> Result<(), SyncError> {
        self.watcher.unwatch(dir)?;
        Ok(())
    }
}

// ============================================================================
// EventWatcher
// ============================================================================

struct WatcherState {
    notifier: Box<dyn DirectoryNotifier>,
    /// Subscribed directory to the job sources that claimed it
    subscribed: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

/// Tracks which directories are subscribed on the notifier, and for whom
pub struct EventWatcher {
    state: Mutex<WatcherState>,
}

impl EventWatcher {
    pub fn new(notifier: Box<dyn DirectoryNotifier>) -> Self {
        Self {
            state: Mutex::new(WatcherState {
                notifier,
                subscribed: BTreeMap::new(),
            }),
        }
    }

    /// Subscribes `root` and every non-ignored directory beneath it on
    /// behalf of the job whose source is `owner`
    ///
    /// Ignored directories are not descended into. Directories that fail
    /// to subscribe are logged and skipped. Blocks on the tree walk.
    /// Returns the number of directories newly watched on the notifier;
    /// directories already watched for another job only gain an owner.
    pub fn subscribe_tree(&self, owner: &Path, root: &Path, matcher: &IgnoreMatcher) -> usize {
        let scan = scan_tree(root, matcher);
        let mut state = self.lock();
        let mut added = 0;
        for dir in scan.directories {
            if let Some(owners) = state.subscribed.get_mut(&dir) {
                owners.insert(owner.to_path_buf());
                continue;
            }
            match state.notifier.watch(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "Subscribed directory");
                    state
                        .subscribed
                        .insert(dir, BTreeSet::from([owner.to_path_buf()]));
                    added += 1;
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "Cannot subscribe directory"),
            }
        }
        info!(
            owner = %owner.display(),
            root = %root.display(),
            added,
            "Subscribed directory tree"
        );
        added
    }

    /// Releases every directory claimed by the job whose source is `owner`
    ///
    /// Directories still claimed by another job stay watched. Returns the
    /// number of directories unwatched on the notifier.
    pub fn unsubscribe_tree(&self, owner: &Path) -> usize {
        let mut state = self.lock();
        let mut orphaned = Vec::new();
        for (dir, owners) in state.subscribed.range_mut(owner.to_path_buf()..) {
            if !dir.starts_with(owner) {
                break;
            }
            if owners.remove(owner) && owners.is_empty() {
                orphaned.push(dir.clone());
            }
        }
        for dir in &orphaned {
            state.subscribed.remove(dir);
            // A directory that vanished was already dropped by the OS
            if let Err(e) = state.notifier.unwatch(dir) {
                debug!(dir = %dir.display(), error = %e, "Unwatch failed");
            }
        }
        info!(owner = %owner.display(), removed = orphaned.len(), "Unsubscribed directory tree");
        orphaned.len()
    }

    pub fn is_subscribed(&self, dir: &Path) -> bool {
        self.lock().subscribed.contains_key(dir)
    }

    /// Job sources holding a subscription on `dir`, sorted
    pub fn owners(&self, dir: &Path) -> Vec<PathBuf> {
        self.lock()
            .subscribed
            .get(dir)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every subscribed directory, sorted
    pub fn subscribed(&self) -> Vec<PathBuf> {
        self.lock().subscribed.keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
