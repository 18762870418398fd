//! backsync Daemon - Background backup service
//!
//! This binary runs as a systemd user service and handles:
//! - Restoring this node's backup jobs on startup
//! - Filesystem events for event-mode jobs
//! - Poll timers for polling-mode jobs (owned by the engine)
//! - An optional periodic reconciliation of every job (`run_all`)
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon builds the engine from the configuration, restores the jobs
//! and then pumps notifier events into the engine until a
//! `CancellationToken` is triggered by SIGTERM or SIGINT. On shutdown the
//! watches are torn down first, then the upload queue persists whatever is
//! still pending, then the database is closed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backsync_cache::{DatabasePool, SqliteRecordStore};
use backsync_core::config::{Config, LoggingConfig, ManifestKind};
use backsync_core::ports::{IPathResolver, IRecordStore, IUploader};
use backsync_sync::engine::{BackupService, RunOutcome};
use backsync_sync::filesystem::{LocalDirectoryUploader, MountTableResolver};
use backsync_sync::manifest::{ManifestStore, RecordManifest, SidecarManifest};
use backsync_sync::queue::{QueueConfig, TaskQueue};
use backsync_sync::watcher::NotifyDirectoryNotifier;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configuration file location
const CONFIG_ENV: &str = "BACKSYNC_CONFIG";

// ============================================================================
// Configuration
// ============================================================================

fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path)
}

/// Loads and validates the configuration file
///
/// An absent file means defaults, which still have to pass validation.
fn load_config(path: &std::path::Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?
    } else {
        warn!(config_path = %path.display(), "No configuration file, using defaults");
        Config::default()
    };

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(field = %e.field, message = %e.message, "Invalid configuration");
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), path.display());
    }
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

// ============================================================================
// DaemonService
// ============================================================================

/// Owns everything the daemon starts and tears down
struct DaemonService {
    config: Config,
    db_pool: DatabasePool,
    queue: Arc<TaskQueue>,
    service: Arc<BackupService>,
    events: Option<tokio::sync::mpsc::Receiver<backsync_sync::watcher::ChangeEvent>>,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the database and wires the engine
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let db_pool = DatabasePool::new(&config.database.path)
            .await
            .context("Failed to open database")?;
        let store: Arc<dyn IRecordStore> =
            Arc::new(SqliteRecordStore::new(db_pool.pool().clone()));

        let resolver: Arc<dyn IPathResolver> = Arc::new(MountTableResolver::new(&config.storages));
        let uploader: Arc<dyn IUploader> = Arc::new(LocalDirectoryUploader::new(&config.storages));

        let queue = Arc::new(TaskQueue::new(
            QueueConfig::from_config(&config.tasks),
            Arc::clone(&resolver),
            uploader,
        ));
        match queue.load_persisted().await {
            Ok(0) => {}
            Ok(n) => info!(tasks = n, "Restored pending upload tasks"),
            Err(e) => warn!(error = %e, "Cannot restore pending upload tasks"),
        }

        let manifest: Arc<dyn ManifestStore> = match config.backup.manifest {
            ManifestKind::Sidecar => Arc::new(SidecarManifest::new()),
            ManifestKind::Record => Arc::new(RecordManifest::new(Arc::clone(&store))),
        };

        let (notifier, events) =
            NotifyDirectoryNotifier::new(config.backup.event_channel_capacity)
                .context("Failed to initialize filesystem notifier")?;

        let service = Arc::new(BackupService::new(
            &config,
            store,
            resolver,
            Arc::clone(&queue),
            manifest,
            Box::new(notifier),
        ));

        Ok(Self {
            config,
            db_pool,
            queue,
            service,
            events: Some(events),
            shutdown,
        })
    }

    /// Restores jobs and handles events until shutdown
    async fn run(&mut self) -> Result<()> {
        info!(
            server_id = %self.config.node.server_id,
            storages = self.config.storages.len(),
            manifest = ?self.config.backup.manifest,
            "Starting backup service"
        );

        let activated = self
            .service
            .init()
            .await
            .context("Failed to restore backup jobs")?;
        info!(activated, "Watching backup jobs");

        let events = self
            .events
            .take()
            .context("Event channel already consumed")?;

        let timer_cancel = self.shutdown.child_token();
        let minutes = self.config.backup.run_all_interval_minutes;
        let timer = (minutes > 0).then(|| {
            info!(interval_minutes = minutes, "Scheduling periodic run-all");
            tokio::spawn(run_all_timer(
                Arc::clone(&self.service),
                Duration::from_secs(minutes.saturating_mul(60)),
                timer_cancel.clone(),
            ))
        });

        Arc::clone(&self.service)
            .run_events(events, self.shutdown.clone())
            .await;

        timer_cancel.cancel();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!(error = %e, "Run-all timer ended abnormally");
            }
        }

        Ok(())
    }

    /// Tears down watches, persists the queue and closes the database
    async fn stop(&self) {
        self.service.shutdown().await;
        self.queue.shutdown().await;
        self.db_pool.close().await;
        info!("Backup daemon stopped");
    }
}

// ============================================================================
// Periodic run-all
// ============================================================================

/// Calls [`BackupService::run_all`] every `period` until `cancel` fires
///
/// The first run happens one period after start. Returns the number of
/// runs that completed.
async fn run_all_timer(
    service: Arc<BackupService>,
    period: Duration,
    cancel: CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut completed = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match service.run_all().await {
            RunOutcome::Skipped => debug!("Run-all still in progress, tick skipped"),
            RunOutcome::Completed {
                jobs,
                changed,
                submitted,
                ..
            } => {
                completed += 1;
                info!(jobs, changed, submitted, "Periodic run-all complete");
            }
        }
    }
    completed
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    init_tracing(&Config::load_or_default(&path).logging);

    info!(config_path = %path.display(), "backsync daemon starting (backsyncd)");
    let config = load_config(&path)?;

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let mut daemon = DaemonService::new(config, shutdown_token.clone()).await?;
    let result = daemon.run().await;
    daemon.stop().await;

    match &result {
        Ok(()) => info!("backsync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "backsync daemon exiting with error"),
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_needs_server_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn test_valid_config_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "node:\n  server_id: nas-01\nbackup:\n  manifest: record\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.node.server_id, "nas-01");
        assert_eq!(config.backup.manifest, ManifestKind::Record);
    }

    #[test]
    fn test_unparsable_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "node: [unclosed").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[tokio::test]
    async fn test_daemon_starts_and_stops_without_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.node.server_id = "node-1".to_string();
        config.database.path = dir.path().join("db/backsync.db");
        config.tasks.persist_path = Some(dir.path().join("tasks.json"));

        let token = CancellationToken::new();
        let mut daemon = DaemonService::new(config, token.clone()).await.unwrap();
        token.cancel();
        daemon.run().await.unwrap();
        daemon.stop().await;

        assert!(dir.path().join("db/backsync.db").exists());
        assert!(daemon.service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_all_timer_runs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.node.server_id = "node-1".to_string();
        config.database.path = dir.path().join("backsync.db");
        config.tasks.persist_path = None;

        let daemon = DaemonService::new(config, CancellationToken::new())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let timer = tokio::spawn(run_all_timer(
            Arc::clone(&daemon.service),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let completed = timer.await.unwrap();
        assert!(completed >= 1);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_daemon_with_run_all_interval_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.node.server_id = "node-1".to_string();
        config.database.path = dir.path().join("backsync.db");
        config.tasks.persist_path = None;
        config.backup.run_all_interval_minutes = 30;

        let token = CancellationToken::new();
        let mut daemon = DaemonService::new(config, token.clone()).await.unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(10), daemon.run())
            .await
            .expect("daemon did not stop")
            .unwrap();
        daemon.stop().await;
    }
}
