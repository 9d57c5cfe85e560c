//! Where lagopus keeps its own files: `config.toml` and launch logs.
//!
//! Everything sits in one `.lagopus` folder. Its parent is the OS config
//! directory unless `LAGOPUS_CONFIG_HOME` names another one, which is how
//! containers and the integration tests relocate it.

use std::path::PathBuf;

use directories::BaseDirs;
use thiserror::Error;

pub const APP_DIR_NAME: &str = ".lagopus";
pub const CONFIG_HOME_ENV: &str = "LAGOPUS_CONFIG_HOME";
const LOGS_DIR_NAME: &str = "logs";

#[derive(Debug, Error)]
pub enum AppDirError {
    #[error("No suitable base config directory available for application files")]
    NoBaseDir,
    #[error("Failed to create application directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The `.lagopus` root, created on first use.
pub fn app_root_dir() -> Result<PathBuf, AppDirError> {
    let base = base_dir().ok_or(AppDirError::NoBaseDir)?;
    ensure_dir(base.join(APP_DIR_NAME))
}

/// `logs/` inside the root, created on first use.
pub fn logs_dir() -> Result<PathBuf, AppDirError> {
    ensure_dir(app_root_dir()?.join(LOGS_DIR_NAME))
}

fn base_dir() -> Option<PathBuf> {
    base_dir_from(std::env::var_os(CONFIG_HOME_ENV).map(PathBuf::from))
}

/// An empty override counts as unset.
fn base_dir_from(env_override: Option<PathBuf>) -> Option<PathBuf> {
    match env_override {
        Some(path) if !path.as_os_str().is_empty() => Some(path),
        _ => BaseDirs::new().map(|dirs| dirs.config_dir().to_path_buf()),
    }
}

fn ensure_dir(path: PathBuf) -> Result<PathBuf, AppDirError> {
    match std::fs::create_dir_all(&path) {
        Ok(()) => Ok(path),
        Err(source) => Err(AppDirError::CreateDir { path, source }),
    }
}
