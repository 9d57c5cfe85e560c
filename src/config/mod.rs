//! TOML configuration for the job service, the scanner and the orchestrator binding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app_dirs;

mod defaults;

use defaults::*;

/// Default filename used to store the configuration.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Aggregate configuration loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LagopusConfig {
    #[serde(default)]
    pub dirs: DirSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub job_defaults: JobDefaults,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Filesystem roots shared with the fuzzing workloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirSettings {
    #[serde(default = "default_base_dir")]
    pub base: PathBuf,
    /// Root holding one working directory per job.
    #[serde(default = "default_jobs_dir")]
    pub jobs: PathBuf,
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            base: default_base_dir(),
            jobs: default_jobs_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite file backing the job and crash tables.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Connection settings for the Kubernetes API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// API server base URL, e.g. `https://kubernetes.default.svc` or a
    /// `kubectl proxy` address.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bearer token file; an empty path sends unauthenticated requests.
    #[serde(default = "default_token_path")]
    pub token_path: Option<PathBuf>,
    /// Container image running the fuzzing driver.
    #[serde(default = "default_image")]
    pub image: String,
    /// Persistent volume claim mounted at the base dir inside job pods.
    #[serde(default = "default_jobs_claim")]
    pub jobs_claim: String,
    /// Attempts per API call before a transport failure is reported.
    #[serde(default = "default_request_attempts")]
    pub request_attempts: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            namespace: default_namespace(),
            token_path: default_token_path(),
            image: default_image(),
            jobs_claim: default_jobs_claim(),
            request_attempts: default_request_attempts(),
        }
    }
}

/// Resource request applied when a submission leaves a field unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_mib: default_memory_mib(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerSettings {
    #[serde(default = "default_scan_interval_secs")]
    pub interval_secs: u64,
    /// Delay between startup connection attempts.
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Startup connection attempts; 0 retries forever.
    #[serde(default)]
    pub connect_attempts: u32,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval_secs(),
            connect_retry_secs: default_connect_retry_secs(),
            connect_attempts: 0,
        }
    }
}

impl ScannerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(clamp_scan_interval(self.interval_secs))
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Overrides the `.lagopus/logs` directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: None,
            level: default_log_level(),
        }
    }
}

/// Errors that may occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config to TOML at {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    #[error("No suitable config directory found")]
    NoConfigDir,
}

/// Resolve the default configuration file path inside the app root.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load configuration from the default location, returning defaults if missing.
pub fn load_or_default() -> Result<LagopusConfig, ConfigError> {
    load_from(&config_path()?)
}

/// Load configuration from a specific path; a missing file yields defaults.
pub fn load_from(path: &Path) -> Result<LagopusConfig, ConfigError> {
    if !path.exists() {
        return Ok(LagopusConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })
}

/// Save configuration to a specific path, creating parent directories as needed.
pub fn save_to_path(config: &LagopusConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = toml::to_string_pretty(config).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, data).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => {
            ConfigError::CreateDir { path, source }
        }
    }
}
