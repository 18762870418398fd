//! Configuration module for backsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for backsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub tasks: TasksConfig,
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
    /// Local-directory storages served by the bundled mount-table resolver.
    pub storages: Vec<StorageConfig>,
}

/// Identity of this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Jobs are node-local; only jobs carrying this id are loaded here.
    pub server_id: String,
}

/// Record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

/// Upload task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Number of concurrent upload workers.
    pub workers: usize,
    /// Extra attempts after the first failure.
    pub max_retry: u32,
    /// Where outstanding tasks are persisted; `None` disables persistence.
    pub persist_path: Option<PathBuf>,
    /// Minimum seconds between two persistence writes.
    pub persist_debounce_secs: u64,
    /// Succeeded tasks kept for inspection; older ones are forgotten.
    pub keep_succeeded: usize,
}

/// Which manifest representation polling jobs use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    /// A hidden JSON file inside every watched directory.
    Sidecar,
    /// One row per file in the record store.
    Record,
}

/// Backup engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Interval applied to polling jobs created without one (minutes).
    pub default_polling_interval_minutes: u64,
    /// Manifest representation.
    pub manifest: ManifestKind,
    /// Pause between submissions to consecutive destinations (milliseconds).
    pub destination_pause_ms: u64,
    /// Capacity of the filesystem event channel.
    pub event_channel_capacity: usize,
    /// Minutes between daemon-driven reconciliations of every job; 0 disables.
    pub run_all_interval_minutes: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

/// A local directory exposed in the virtual remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Virtual mount path, e.g. `/remote/backup1`.
    pub mount_path: String,
    /// Local directory backing the mount.
    pub root: PathBuf,
    /// Reject uploads to this storage.
    #[serde(default)]
    pub no_upload: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/backsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("backsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("backsync")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("backsync.db"),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_retry: 3,
            persist_path: Some(data_dir().join("backup_tasks.json")),
            persist_debounce_secs: 3,
            keep_succeeded: 256,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            default_polling_interval_minutes: 60,
            manifest: ManifestKind::Sidecar,
            destination_pause_ms: 5,
            event_channel_capacity: 1024,
            run_all_interval_minutes: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"tasks.workers"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- node ---
        if self.node.server_id.trim().is_empty() {
            errors.push(ValidationError {
                field: "node.server_id".into(),
                message: "must be set; backup jobs are bound to a node".into(),
            });
        }

        // --- tasks ---
        if self.tasks.workers == 0 {
            errors.push(ValidationError {
                field: "tasks.workers".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- backup ---
        if self.backup.default_polling_interval_minutes == 0 {
            errors.push(ValidationError {
                field: "backup.default_polling_interval_minutes".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.backup.event_channel_capacity == 0 {
            errors.push(ValidationError {
                field: "backup.event_channel_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        // --- storages ---
        for (i, storage) in self.storages.iter().enumerate() {
            if !storage.mount_path.starts_with('/') {
                errors.push(ValidationError {
                    field: format!("storages[{i}].mount_path"),
                    message: format!("must be absolute: '{}'", storage.mount_path),
                });
            }
            let duplicate = self.storages[..i]
                .iter()
                .any(|other| other.mount_path == storage.mount_path);
            if duplicate {
                errors.push(ValidationError {
                    field: format!("storages[{i}].mount_path"),
                    message: format!("duplicate mount path '{}'", storage.mount_path),
                });
            }
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use backsync_core::config::{ConfigBuilder, ManifestKind};
///
/// let config = ConfigBuilder::new()
///     .server_id("nas-01")
///     .tasks_workers(4)
///     .backup_manifest(ManifestKind::Record)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.config.node.server_id = id.into();
        self
    }

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.database.path = path;
        self
    }

    // --- tasks ---

    pub fn tasks_workers(mut self, n: usize) -> Self {
        self.config.tasks.workers = n;
        self
    }

    pub fn tasks_max_retry(mut self, n: u32) -> Self {
        self.config.tasks.max_retry = n;
        self
    }

    pub fn tasks_persist_path(mut self, path: Option<PathBuf>) -> Self {
        self.config.tasks.persist_path = path;
        self
    }

    pub fn tasks_persist_debounce_secs(mut self, secs: u64) -> Self {
        self.config.tasks.persist_debounce_secs = secs;
        self
    }

    pub fn tasks_keep_succeeded(mut self, n: usize) -> Self {
        self.config.tasks.keep_succeeded = n;
        self
    }

    // --- backup ---

    pub fn backup_default_polling_interval_minutes(mut self, minutes: u64) -> Self {
        self.config.backup.default_polling_interval_minutes = minutes;
        self
    }

    pub fn backup_manifest(mut self, kind: ManifestKind) -> Self {
        self.config.backup.manifest = kind;
        self
    }

    pub fn backup_destination_pause_ms(mut self, ms: u64) -> Self {
        self.config.backup.destination_pause_ms = ms;
        self
    }

    pub fn backup_run_all_interval_minutes(mut self, minutes: u64) -> Self {
        self.config.backup.run_all_interval_minutes = minutes;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- storages ---

    pub fn storage(mut self, mount_path: impl Into<String>, root: PathBuf) -> Self {
        self.config.storages.push(StorageConfig {
            mount_path: mount_path.into(),
            root,
            no_upload: false,
        });
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert!(cfg.node.server_id.is_empty());
        assert!(cfg.database.path.ends_with("backsync.db"));
        assert_eq!(cfg.tasks.workers, 3);
        assert_eq!(cfg.tasks.max_retry, 3);
        assert!(cfg.tasks.persist_path.is_some());
        assert_eq!(cfg.tasks.persist_debounce_secs, 3);
        assert_eq!(cfg.tasks.keep_succeeded, 256);
        assert_eq!(cfg.backup.default_polling_interval_minutes, 60);
        assert_eq!(cfg.backup.manifest, ManifestKind::Sidecar);
        assert_eq!(cfg.backup.destination_pause_ms, 5);
        assert_eq!(cfg.backup.event_channel_capacity, 1024);
        assert_eq!(cfg.backup.run_all_interval_minutes, 0);
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
        assert!(cfg.storages.is_empty());
    }

    #[test]
    fn default_config_only_lacks_server_id() {
        let errors = Config::default().validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "node.server_id");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
node:
  server_id: nas-01
database:
  path: /tmp/backsync-test.db
tasks:
  workers: 5
  max_retry: 1
  persist_path: /tmp/tasks.json
  persist_debounce_secs: 10
backup:
  default_polling_interval_minutes: 15
  manifest: record
  destination_pause_ms: 0
  event_channel_capacity: 64
logging:
  level: debug
  json: true
storages:
  - mount_path: /remote/backup1
    root: /mnt/disk1
  - mount_path: /remote/archive
    root: /mnt/archive
    no_upload: true
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.node.server_id, "nas-01");
        assert_eq!(cfg.database.path, PathBuf::from("/tmp/backsync-test.db"));
        assert_eq!(cfg.tasks.workers, 5);
        assert_eq!(cfg.tasks.max_retry, 1);
        assert_eq!(cfg.tasks.persist_path, Some(PathBuf::from("/tmp/tasks.json")));
        assert_eq!(cfg.tasks.persist_debounce_secs, 10);
        assert_eq!(cfg.backup.default_polling_interval_minutes, 15);
        assert_eq!(cfg.backup.manifest, ManifestKind::Record);
        assert_eq!(cfg.backup.destination_pause_ms, 0);
        assert_eq!(cfg.backup.event_channel_capacity, 64);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert_eq!(cfg.storages.len(), 2);
        assert!(!cfg.storages[0].no_upload);
        assert!(cfg.storages[1].no_upload);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_partial_yaml_fills_defaults() {
        let yaml = "node:\n  server_id: laptop\n";
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.node.server_id, "laptop");
        assert_eq!(cfg.tasks.workers, 3);
        assert_eq!(cfg.backup.manifest, ManifestKind::Sidecar);
    }

    #[test]
    fn load_or_default_returns_default_on_missing_file() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.tasks.workers, 3);
    }

    // -- Validation --

    #[test]
    fn validate_reports_every_problem() {
        let mut cfg = ConfigBuilder::new()
            .tasks_workers(0)
            .backup_default_polling_interval_minutes(0)
            .logging_level("verbose")
            .storage("relative", PathBuf::from("/mnt/a"))
            .storage("relative", PathBuf::from("/mnt/b"))
            .build();
        cfg.backup.event_channel_capacity = 0;

        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        assert!(fields.contains(&"node.server_id".to_string()));
        assert!(fields.contains(&"tasks.workers".to_string()));
        assert!(fields.contains(&"backup.default_polling_interval_minutes".to_string()));
        assert!(fields.contains(&"backup.event_channel_capacity".to_string()));
        assert!(fields.contains(&"logging.level".to_string()));
        assert!(fields.contains(&"storages[0].mount_path".to_string()));
        assert_eq!(
            fields.iter().filter(|f| *f == "storages[1].mount_path").count(),
            2
        );
    }

    #[test]
    fn builder_build_validated() {
        let ok = ConfigBuilder::new()
            .server_id("nas-01")
            .storage("/remote/a", PathBuf::from("/mnt/a"))
            .build_validated();
        assert!(ok.is_ok());

        let err = ConfigBuilder::new().build_validated().unwrap_err();
        assert_eq!(err[0].to_string(), "node.server_id: must be set; backup jobs are bound to a node");
    }
}
