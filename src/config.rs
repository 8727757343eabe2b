//! Configuration for the scanner and the scan coordinator

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ScanError;

/// Default large file threshold (100 MB)
pub const DEFAULT_LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Catalog file used when no path is configured
pub const DEFAULT_CATALOG_FILE: &str = "photo_indexer.db";

/// Default quiescence window after which hints are discarded (5 minutes)
pub const DEFAULT_HINT_QUIESCENCE_MS: u64 = 5 * 60 * 1000;

/// Default delay for debounced scoped scans
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Default poll interval while waiting for the worker to become idle
pub const DEFAULT_CANCEL_POLL_MS: u64 = 20;

/// Default capacity of the notification channel
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 4096;

/// Configuration for the collection scanner and its catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Album root directories of the collection
    pub roots: Vec<PathBuf>,

    /// File extensions to include (whitelist)
    /// If empty, all files are included
    pub extensions: HashSet<String>,

    /// Directory names to ignore
    pub ignore_dirs: HashSet<String>,

    /// Whether to compute unique hashes while scanning
    pub compute_hash: bool,

    /// Threshold for using partial hash (bytes)
    /// Files larger than this use partial hash (first 1MB + last 1MB)
    pub large_file_threshold: u64,

    /// Catalog database path
    pub db_path: Option<PathBuf>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: Self::default_extensions(),
            ignore_dirs: Self::default_ignore_dirs(),
            compute_hash: true,
            large_file_threshold: DEFAULT_LARGE_FILE_THRESHOLD,
            db_path: None,
        }
    }
}

impl ScanConfig {
    /// Create a new config with the given album roots
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            ..Default::default()
        }
    }

    /// Create a config builder
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder::new()
    }

    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path).map_err(|e| ScanError::from(e).with_path(path))?;
        serde_json::from_str(&text).map_err(|e| {
            ScanError::io_error(Some(path.to_path_buf()), format!("Invalid config: {}", e))
        })
    }

    /// Get the default video extensions
    pub fn default_video_extensions() -> HashSet<String> {
        [
            "mp4", "mkv", "avi", "wmv", "flv", "mov", "webm", "m4v", "mts", "3gp",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Get the default image extensions, raw formats included
    pub fn default_image_extensions() -> HashSet<String> {
        [
            "jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "tif", "heic", "cr2", "nef", "arw",
            "dng", "orf", "raf",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Get the default audio extensions
    pub fn default_audio_extensions() -> HashSet<String> {
        ["mp3", "flac", "wav", "aac", "ogg", "m4a"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Get all default media extensions
    pub fn default_extensions() -> HashSet<String> {
        let mut extensions = Self::default_image_extensions();
        extensions.extend(Self::default_video_extensions());
        extensions.extend(Self::default_audio_extensions());
        extensions
    }

    /// Get the default directories to ignore
    pub fn default_ignore_dirs() -> HashSet<String> {
        [
            "$RECYCLE.BIN",
            "System Volume Information",
            "@eaDir",
            "lost+found",
            "node_modules",
            "__pycache__",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Catalog path, falling back to `DEFAULT_CATALOG_FILE`
    pub fn catalog_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_FILE))
    }

    /// Check if an extension should be included
    pub fn should_include_extension(&self, ext: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        self.extensions.contains(&ext.to_lowercase())
    }

    /// Check if a directory should be ignored
    pub fn should_ignore_dir(&self, name: &str) -> bool {
        // Ignore hidden directories (starting with .)
        if name.starts_with('.') {
            return true;
        }
        self.ignore_dirs.contains(name)
    }
}

/// Builder for ScanConfig
#[derive(Debug, Default)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the album roots
    pub fn roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.config.roots = roots;
        self
    }

    /// Add an album root
    pub fn add_root(mut self, root: PathBuf) -> Self {
        self.config.roots.push(root);
        self
    }

    /// Set the extensions whitelist
    pub fn extensions(mut self, extensions: HashSet<String>) -> Self {
        self.config.extensions = extensions;
        self
    }

    /// Set only image extensions
    pub fn image_only(mut self) -> Self {
        self.config.extensions = ScanConfig::default_image_extensions();
        self
    }

    /// Add a directory to ignore
    pub fn add_ignore_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.ignore_dirs.insert(dir.into());
        self
    }

    /// Enable or disable hash computation
    pub fn compute_hash(mut self, enabled: bool) -> Self {
        self.config.compute_hash = enabled;
        self
    }

    /// Set the large file threshold
    pub fn large_file_threshold(mut self, threshold: u64) -> Self {
        self.config.large_file_threshold = threshold;
        self
    }

    /// Set the catalog path
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = Some(path);
        self
    }

    /// Build the config
    pub fn build(self) -> ScanConfig {
        self.config
    }
}

/// Timing and channel settings of the scan coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Idle time after the last recorded hint before the hint cache is cleared
    pub hint_quiescence_ms: u64,
    /// Delay applied by debounced scoped scans
    pub debounce_ms: u64,
    /// Poll interval of `cancel_and_suspend` while the worker finishes a task
    pub cancel_poll_ms: u64,
    /// Capacity of the notification channel; overflowing notifications are dropped
    pub notification_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hint_quiescence_ms: DEFAULT_HINT_QUIESCENCE_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            cancel_poll_ms: DEFAULT_CANCEL_POLL_MS,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    pub fn hint_quiescence(&self) -> Duration {
        Duration::from_millis(self.hint_quiescence_ms)
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Poll interval, never zero
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_ms.max(1))
    }
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn hint_quiescence(mut self, window: Duration) -> Self {
        self.config.hint_quiescence_ms = window.as_millis() as u64;
        self
    }

    pub fn debounce_interval(mut self, interval: Duration) -> Self {
        self.config.debounce_ms = interval.as_millis() as u64;
        self
    }

    pub fn cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.config.cancel_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity;
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert!(config.roots.is_empty());
        assert!(config.compute_hash);
        assert_eq!(config.large_file_threshold, DEFAULT_LARGE_FILE_THRESHOLD);
        assert!(config.db_path.is_none());
        assert_eq!(config.catalog_path(), PathBuf::from(DEFAULT_CATALOG_FILE));
    }

    #[test]
    fn test_should_include_extension() {
        let config = ScanConfig::default();
        assert!(config.should_include_extension("jpg"));
        assert!(config.should_include_extension("NEF"));
        assert!(config.should_include_extension("mp4"));
        assert!(!config.should_include_extension("txt"));

        let all = ScanConfig::builder().extensions(HashSet::new()).build();
        assert!(all.should_include_extension("txt"));
    }

    #[test]
    fn test_should_ignore_dir() {
        let config = ScanConfig::default();
        assert!(config.should_ignore_dir(".thumbnails"));
        assert!(config.should_ignore_dir("@eaDir"));
        assert!(!config.should_ignore_dir("Trips"));
    }

    #[test]
    fn test_config_builder() {
        let config = ScanConfig::builder()
            .add_root(PathBuf::from("/photos"))
            .image_only()
            .compute_hash(false)
            .db_path(PathBuf::from("catalog.db"))
            .build();

        assert_eq!(config.roots.len(), 1);
        assert!(!config.compute_hash);
        assert!(config.extensions.contains("jpg"));
        assert!(!config.extensions.contains("mp4"));
        assert_eq!(config.db_path, Some(PathBuf::from("catalog.db")));
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "roots": ["/photos"], "compute_hash": false }"#).unwrap();

        let config = ScanConfig::from_json_file(&path).unwrap();
        assert_eq!(config.roots, vec![PathBuf::from("/photos")]);
        assert!(!config.compute_hash);
        assert!(config.extensions.contains("jpg"));
    }

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.hint_quiescence(), Duration::from_secs(300));
        assert_eq!(config.debounce_interval(), Duration::from_millis(500));
        assert_eq!(config.cancel_poll_interval(), Duration::from_millis(20));

        let zero = CoordinatorConfig::builder()
            .cancel_poll_interval(Duration::ZERO)
            .build();
        assert_eq!(zero.cancel_poll_interval(), Duration::from_millis(1));
    }
}
