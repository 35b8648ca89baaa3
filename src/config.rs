//! Engine Configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::store::ArtifactRef;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_job_timeout_secs() -> u64 { 60 }
fn default_cache_capacity() -> usize { 24 }
fn default_max_source_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_elements() -> usize { 10_000 }
fn default_max_audio_bytes() -> usize { 5 * 1024 * 1024 }
fn default_basemap() -> String { "Esri.WorldTopoMap".to_string() }
fn default_max_jobs() -> usize { 30 }
fn default_window_secs() -> u64 { 60 }
fn default_worker_args() -> Vec<String> { vec!["worker".to_string()] }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Limit for payload source and for each imported artifact
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    /// Decoded size limit of embedded audio
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Library used by territory-set renders with the builtin source
    #[serde(default)]
    pub builtin_library: Option<ArtifactRef>,
    /// Basemap applied when a render declares none
    #[serde(default = "default_basemap")]
    pub default_basemap: String,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Runs jobs on the blocking pool; a cancelled job is abandoned, not stopped
    InProcess,
    #[default]
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    #[serde(default)]
    pub mode: WorkerMode,
    /// Worker executable; defaults to the running binary
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::default(),
            program: None,
            args: default_worker_args(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            job_timeout_secs: default_job_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            max_source_bytes: default_max_source_bytes(),
            max_elements: default_max_elements(),
            max_audio_bytes: default_max_audio_bytes(),
            rate_limit: RateLimitConfig::default(),
            builtin_library: None,
            default_basemap: default_basemap(),
            worker: WorkerConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.job_timeout(), Duration::from_secs(60));
        assert_eq!(config.cache_capacity, 24);
        assert_eq!(config.rate_limit.max_jobs, 30);
        assert_eq!(config.worker.args, vec!["worker"]);
        assert_eq!(config.worker.mode, WorkerMode::Process);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"job_timeout_secs": 5, "builtin_library": "/system/lib/builtin", "worker": {{"mode": "in_process"}}}}"#
        )
        .unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.job_timeout_secs, 5);
        assert_eq!(config.worker.mode, WorkerMode::InProcess);
        assert_eq!(config.builtin_library.unwrap().owner.as_deref(), Some("system"));
        assert_eq!(config.max_elements, 10_000);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/mapforge.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_, _)));
    }
}
