//! Engine Configuration
//!
//! `SyncConfig` carries everything the synchronization jobs need: which parts
//! of the source tree are mirrored, how often the reconciler runs, how the
//! full re-index parallelizes its writes, and where the database lives.
//!
//! Configuration is plain data: it can be built in code, deserialized from a
//! JSON document, or loaded from a file with [`SyncConfig::from_json_file`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default interval of the periodic reconciler in seconds
pub const DEFAULT_PERIODIC_INTERVAL_SECS: u64 = 5;

/// Longest accepted periodic interval in seconds
pub const MAX_PERIODIC_INTERVAL_SECS: u64 = 60;

/// Default number of property write workers during a full re-index
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of visited nodes between intermediate commits
pub const DEFAULT_COMMIT_THRESHOLD: usize = 2048;

/// Default busy timeout applied to every connection (milliseconds)
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    /// Configuration document is not valid JSON for `SyncConfig`
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(#[from] serde_json::Error),

    /// A setting has a value the engine cannot work with
    #[error("Invalid setting `{field}`: {reason}")]
    InvalidSetting { field: String, reason: String },

    /// Database connection parameters are missing
    #[error("Database connection is not configured")]
    IncompleteConnection,
}

impl ConfigError {
    pub fn invalid_setting(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Database connection parameters
///
/// A plain filesystem path or a `file:` URL opens a local database. URLs with
/// a `libsql://`, `http(s)://` or `ws(s)://` scheme connect to a remote
/// libsql server, authenticated with `auth_token`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub url: String,
    pub auth_token: Option<String>,
}

const REMOTE_SCHEMES: &[&str] = &["libsql://", "http://", "https://", "ws://", "wss://"];

impl ConnectionInfo {
    /// Connection to a local database file
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self {
            url: path.as_ref().to_string_lossy().into_owned(),
            auth_token: None,
        }
    }

    /// Connection to a remote libsql server
    pub fn remote(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: Some(auth_token.into()),
        }
    }

    pub fn is_remote(&self) -> bool {
        REMOTE_SCHEMES
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
    }

    /// Filesystem path of a local database, `None` for remote connections
    pub fn local_path(&self) -> Option<&Path> {
        if self.is_remote() || self.url.is_empty() {
            return None;
        }
        Some(Path::new(self.url.strip_prefix("file:").unwrap_or(&self.url)))
    }

    /// True when no database has been configured
    pub fn is_incomplete(&self) -> bool {
        self.url.trim().is_empty()
    }
}

/// Include/exclude prefix rules
///
/// A path qualifies when it lies at or below one of the include prefixes and
/// not at or below any exclude prefix. Exclusion always wins. Matching is a
/// plain string prefix test, so `/content/x` covers `/content/xy` as well as
/// `/content/x/y`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl PathFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse rule text with one `+/include/path` or `-/exclude/path` per line
    ///
    /// Blank lines are ignored; lines with any other prefix are logged and
    /// skipped.
    pub fn from_rules(rules: &str) -> Self {
        let mut filter = Self::default();
        for line in rules.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(path) = line.strip_prefix('+') {
                filter.include.push(path.trim().to_string());
            } else if let Some(path) = line.strip_prefix('-') {
                filter.exclude.push(path.trim().to_string());
            } else {
                tracing::warn!("Ignoring path rule without +/- prefix: {}", line);
            }
        }
        filter
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_included(&self, path: &str) -> bool {
        self.include
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether changes to `path` should reach the mirror
    pub fn should_update(&self, path: &str) -> bool {
        self.is_included(path) && !self.is_excluded(path)
    }
}

/// Synchronization engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Roots of the mirrored subtrees
    pub include_paths: Vec<String>,
    /// Subtrees never mirrored, even below an include path
    pub exclude_paths: Vec<String>,
    /// Seconds between reconciler runs, clamped to 1..=60
    pub periodic_interval_secs: u64,
    /// When false the reconciler also scans for nodes modified since the
    /// last checkpoint
    pub trust_queue: bool,
    pub worker_count: usize,
    /// Visited nodes between intermediate commits of a traversal
    pub commit_threshold: usize,
    /// Property batches buffered between traversal and workers
    pub batch_queue_capacity: usize,
    /// Pending rows after which a worker commits without waiting for an idle queue
    pub worker_commit_rows: usize,
    pub busy_timeout_ms: u64,
    pub instant_enabled: bool,
    pub periodic_enabled: bool,
    pub connection: ConnectionInfo,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include_paths: vec!["/content".to_string()],
            exclude_paths: Vec::new(),
            periodic_interval_secs: DEFAULT_PERIODIC_INTERVAL_SECS,
            trust_queue: true,
            worker_count: DEFAULT_WORKER_COUNT,
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
            batch_queue_capacity: 2 * DEFAULT_COMMIT_THRESHOLD,
            worker_commit_rows: 4096,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            instant_enabled: true,
            periodic_enabled: true,
            connection: ConnectionInfo::default(),
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields take their default values. The result is validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        let config: SyncConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings the jobs rely on
    ///
    /// The batch queue must hold at least one commit window of batches, which
    /// is what the re-index hands to the workers after every main commit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.is_incomplete() {
            return Err(ConfigError::IncompleteConnection);
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid_setting("workerCount", "must be at least 1"));
        }
        if self.commit_threshold == 0 {
            return Err(ConfigError::invalid_setting(
                "commitThreshold",
                "must be at least 1",
            ));
        }
        if self.worker_commit_rows == 0 {
            return Err(ConfigError::invalid_setting(
                "workerCommitRows",
                "must be at least 1",
            ));
        }
        if self.batch_queue_capacity < self.commit_threshold {
            return Err(ConfigError::invalid_setting(
                "batchQueueCapacity",
                format!(
                    "must be at least commitThreshold ({})",
                    self.commit_threshold
                ),
            ));
        }
        if self.include_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(ConfigError::invalid_setting(
                "includePaths",
                "paths must be absolute",
            ));
        }
        Ok(())
    }

    /// Periodic interval clamped to the supported range
    pub fn periodic_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.periodic_interval_secs
                .clamp(1, MAX_PERIODIC_INTERVAL_SECS),
        )
    }

    pub fn path_filter(&self) -> PathFilter {
        PathFilter::new(self.include_paths.clone(), self.exclude_paths.clone())
    }
}
