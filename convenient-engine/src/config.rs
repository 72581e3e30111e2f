//! Engine configuration

use crate::error::EngineResult;
use convenient_executor::WorkerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Dependency-file rule key mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepFiles {
    /// Never compute dependency-file rule keys
    Disabled,
    /// Compute dependency-file keys and store artifacts under them
    Enabled,
    /// Additionally keep manifests and fetch through them
    #[default]
    Cache,
}

/// Scheduling strategy for waiting on dependencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Re-enqueue unready tasks
    #[default]
    Default,
    /// Park unready tasks until their dependencies finish
    Toposort,
}

impl From<SchedulerKind> for WorkerKind {
    fn from(kind: SchedulerKind) -> Self {
        match kind {
            SchedulerKind::Default => WorkerKind::Default,
            SchedulerKind::Toposort => WorkerKind::Toposort,
        }
    }
}

/// Artifact cache backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Local directory cache
    pub dir: Option<PathBuf>,

    /// Remote HTTP cache base URL
    pub http_url: Option<String>,

    /// Fetch only, never store
    pub read_only: bool,
}

impl CacheSettings {
    /// Whether any backend is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some() || self.http_url.is_some()
    }
}

/// Configuration of the caching build engine and orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of scheduler worker threads
    pub threads: usize,

    /// Continue past failed rules and report all failures at the end
    pub keep_going: bool,

    /// How scheduler workers wait for dependencies
    pub scheduler: SchedulerKind,

    /// Dependency-file rule key mode
    pub dep_files: DepFiles,

    /// A manifest is reset once it holds this many entries
    pub max_dep_file_cache_entries: usize,

    /// Output directory, relative to the project root
    pub out_dir: PathBuf,

    /// Artifact caches
    pub cache: CacheSettings,

    /// Console report lists at most this many rules
    pub max_build_report_entries: usize,

    /// Threads of the runtime running cache uploads
    pub upload_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            keep_going: false,
            scheduler: SchedulerKind::Default,
            dep_files: DepFiles::Cache,
            max_dep_file_cache_entries: 256,
            out_dir: PathBuf::from("hitzeleiter-out"),
            cache: CacheSettings::default(),
            max_build_report_entries: 100,
            upload_threads: 2,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// I/O errors and malformed JSON
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"keep_going": true, "dep_files": "enabled", "cache": {"dir": "/c"}}"#).unwrap();
        assert!(config.keep_going);
        assert_eq!(config.dep_files, DepFiles::Enabled);
        assert_eq!(config.cache.dir.as_deref(), Some(Path::new("/c")));
        assert!(config.cache.is_enabled());
        assert_eq!(config.max_dep_file_cache_entries, 256);
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_scheduler_kind_maps_to_worker_kind() {
        assert_eq!(WorkerKind::from(SchedulerKind::Toposort), WorkerKind::Toposort);
        let kind: SchedulerKind = serde_json::from_str("\"toposort\"").unwrap();
        assert_eq!(kind, SchedulerKind::Toposort);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hitzeleiter.json");
        std::fs::write(&path, r#"{"threads": 3, "out_dir": "build-out"}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.out_dir, PathBuf::from("build-out"));
        assert!(EngineConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
