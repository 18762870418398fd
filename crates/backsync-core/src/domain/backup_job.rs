//! BackupJob domain entity
//!
//! A backup job maps one local source directory to one or more remote
//! destination directories. Jobs are node-local: the `server_id` names the
//! node whose filesystem `src` lives on.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::JobId;

/// Separator used when `dst` and `ignore` lists are stored as a single string
pub const LIST_SEPARATOR: char = ';';

// ============================================================================
// WatchMode
// ============================================================================

/// How changes under a job's source directory are detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// OS filesystem notifications; suited to long-running hosts
    Event,
    /// Periodic full-tree comparison against the manifest; suited to hosts
    /// that are regularly switched off
    Polling,
}

impl WatchMode {
    /// Stable integer code used by the record store
    pub fn code(&self) -> i64 {
        match self {
            WatchMode::Event => 1,
            WatchMode::Polling => 2,
        }
    }

    /// Parses the record store's integer code
    pub fn from_code(code: i64) -> Result<Self, DomainError> {
        match code {
            1 => Ok(WatchMode::Event),
            2 => Ok(WatchMode::Polling),
            other => Err(DomainError::InvalidMode(other.to_string())),
        }
    }
}

impl Default for WatchMode {
    fn default() -> Self {
        WatchMode::Event
    }
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMode::Event => write!(f, "event"),
            WatchMode::Polling => write!(f, "polling"),
        }
    }
}

// ============================================================================
// BackupJob
// ============================================================================

/// A configured source-directory-to-destinations backup mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    /// Record store id (unassigned until created)
    #[serde(default)]
    pub id: JobId,
    /// Node that owns `src`
    #[serde(default)]
    pub server_id: String,
    /// Absolute, slash-normalized source directory
    pub src: PathBuf,
    /// Ordered destination directories in the virtual remote namespace
    pub dst: Vec<String>,
    /// Gitignore-style patterns, relative to `src`
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Disabled jobs are persisted but not watched
    #[serde(default)]
    pub disabled: bool,
    /// Change detection mode
    #[serde(default)]
    pub mode: WatchMode,
    /// Minutes between polling cycles; zero means "use the default"
    #[serde(default)]
    pub polling_interval_minutes: u64,
    /// Upload every existing file once after creation (event mode only)
    #[serde(default)]
    pub init_upload: bool,
    /// When the job was first stored
    pub created_at: DateTime<Utc>,
    /// When the job was last stored
    pub updated_at: DateTime<Utc>,
}

impl BackupJob {
    /// Creates an enabled event-mode job with no ignore patterns
    pub fn new(src: impl Into<PathBuf>, dst: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::unassigned(),
            server_id: String::new(),
            src: src.into(),
            dst,
            ignore: Vec::new(),
            disabled: false,
            mode: WatchMode::Event,
            polling_interval_minutes: 0,
            init_upload: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the watch mode and polling interval (in minutes)
    pub fn with_mode(mut self, mode: WatchMode, polling_interval_minutes: u64) -> Self {
        self.mode = mode;
        self.polling_interval_minutes = polling_interval_minutes;
        self
    }

    /// Sets the ignore patterns
    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns;
        self
    }

    /// Enables the one-off upload of existing files on creation
    pub fn with_init_upload(mut self, init_upload: bool) -> Self {
        self.init_upload = init_upload;
        self
    }

    /// Marks the job as disabled
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Splits a `;`-delimited list, dropping empty segments
    pub fn parse_list(raw: &str) -> Vec<String> {
        raw.split(LIST_SEPARATOR)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Joins a list back into its `;`-delimited stored form
    pub fn join_list(items: &[String]) -> String {
        items.join(&LIST_SEPARATOR.to_string())
    }

    /// Destinations in stored form
    pub fn dst_string(&self) -> String {
        Self::join_list(&self.dst)
    }

    /// Ignore patterns in stored form
    pub fn ignore_string(&self) -> String {
        Self::join_list(&self.ignore)
    }

    /// Returns true if the job is watched by filesystem notifications
    pub fn is_event_mode(&self) -> bool {
        self.mode == WatchMode::Event
    }

    /// Returns true if the job is watched by periodic polling
    pub fn is_polling_mode(&self) -> bool {
        self.mode == WatchMode::Polling
    }

    /// The polling period as a [`Duration`]
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_minutes.saturating_mul(60))
    }

    /// Normalizes `src` and every `dst` entry to clean slash-separated form
    pub fn normalize(&mut self) {
        self.src = PathBuf::from(clean_slash_path(&self.src.to_string_lossy()));
        self.dst = self
            .dst
            .iter()
            .map(|d| clean_slash_path(d))
            .filter(|d| !d.is_empty())
            .collect();
        self.ignore.retain(|p| !p.trim().is_empty());
    }

    /// Fills in the polling interval for polling jobs that left it unset
    pub fn apply_defaults(&mut self, default_polling_minutes: u64) {
        if self.mode == WatchMode::Polling && self.polling_interval_minutes == 0 {
            self.polling_interval_minutes = default_polling_minutes;
        }
    }

    /// Checks the invariants that do not need filesystem or backend access
    ///
    /// Source existence and destination resolution are checked by the
    /// engine, which owns those collaborators.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if !self.src.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "src must be absolute: {}",
                self.src.display()
            )));
        }
        if self.dst.is_empty() {
            return Err(DomainError::ValidationFailed(
                "at least one destination is required".to_string(),
            ));
        }
        if self.mode == WatchMode::Polling && self.polling_interval_minutes == 0 {
            return Err(DomainError::InvalidInterval(
                "polling interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of `file` relative to `src`, slash-separated
    ///
    /// Returns `None` when `file` is not below `src`.
    pub fn relative_path(&self, file: &Path) -> Option<String> {
        let rel = file.strip_prefix(&self.src).ok()?;
        let joined = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Some(joined)
    }
}

/// Cleans a path lexically: converts `\` to `/`, collapses repeated
/// separators, resolves `.` and `..`, and drops a trailing separator
///
/// An absolute input stays absolute; `..` never climbs above the root.
pub fn clean_slash_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return String::new();
    }
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let body = parts.join("/");
    match (absolute, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_mode_codes() {
        assert_eq!(WatchMode::Event.code(), 1);
        assert_eq!(WatchMode::Polling.code(), 2);
        assert_eq!(WatchMode::from_code(2).unwrap(), WatchMode::Polling);
        assert!(WatchMode::from_code(9).is_err());
    }

    #[test]
    fn test_parse_and_join_list() {
        let items = BackupJob::parse_list("/remote/a; /remote/b;;");
        assert_eq!(items, vec!["/remote/a".to_string(), "/remote/b".to_string()]);
        assert_eq!(BackupJob::join_list(&items), "/remote/a;/remote/b");
        assert!(BackupJob::parse_list("").is_empty());
    }

    #[test]
    fn test_clean_slash_path() {
        assert_eq!(clean_slash_path("/data//docs/"), "/data/docs");
        assert_eq!(clean_slash_path("/data/./docs/../pics"), "/data/pics");
        assert_eq!(clean_slash_path("C:\\data\\docs"), "C:/data/docs");
        assert_eq!(clean_slash_path("/.."), "/");
        assert_eq!(clean_slash_path("a/../.."), "..");
        assert_eq!(clean_slash_path(""), "");
    }

    #[test]
    fn test_normalize() {
        let mut job = BackupJob::new(
            "/data/docs/",
            vec!["/remote/backup1/".to_string(), " ".to_string()],
        )
        .with_ignore(vec!["*.tmp".to_string(), "".to_string()]);
        job.normalize();
        assert_eq!(job.src, PathBuf::from("/data/docs"));
        assert_eq!(job.dst, vec!["/remote/backup1".to_string()]);
        assert_eq!(job.ignore, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn test_apply_defaults_only_for_polling() {
        let mut event = BackupJob::new("/data", vec!["/r".into()]);
        event.apply_defaults(60);
        assert_eq!(event.polling_interval_minutes, 0);

        let mut polling = BackupJob::new("/data", vec!["/r".into()]).with_mode(WatchMode::Polling, 0);
        polling.apply_defaults(60);
        assert_eq!(polling.polling_interval_minutes, 60);
        assert_eq!(polling.polling_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_check_invariants() {
        let job = BackupJob::new("/data", vec!["/r".into()]);
        assert!(job.check_invariants().is_ok());

        let relative = BackupJob::new("data", vec!["/r".into()]);
        assert!(matches!(
            relative.check_invariants(),
            Err(DomainError::InvalidPath(_))
        ));

        let no_dst = BackupJob::new("/data", vec![]);
        assert!(matches!(
            no_dst.check_invariants(),
            Err(DomainError::ValidationFailed(_))
        ));

        let zero_poll = BackupJob::new("/data", vec!["/r".into()]).with_mode(WatchMode::Polling, 0);
        assert!(matches!(
            zero_poll.check_invariants(),
            Err(DomainError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_relative_path() {
        let job = BackupJob::new("/data/docs", vec!["/r".into()]);
        assert_eq!(
            job.relative_path(Path::new("/data/docs/x/y.txt")),
            Some("x/y.txt".to_string())
        );
        assert_eq!(job.relative_path(Path::new("/data/docs")), Some(String::new()));
        assert_eq!(job.relative_path(Path::new("/data/other/y.txt")), None);
    }

    #[test]
    fn test_serde_roundtrip_defaults() {
        let json = r#"{
            "src": "/data/docs",
            "dst": ["/remote/a"],
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let job: BackupJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.mode, WatchMode::Event);
        assert!(!job.disabled);
        assert!(!job.id.is_assigned());
    }
}
