//! Tracing setup shared by the CLI and the long-running scanner.
//!
//! Console output goes to stderr so command results on stdout stay valid
//! JSON. Each launch also appends to its own `lagopus_<timestamp>.log`; older
//! launch logs beyond [`KEPT_LAUNCH_LOGS`] are deleted.

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::OnceLock,
    time::SystemTime,
};

use time::{OffsetDateTime, UtcOffset, format_description::FormatItem, macros::format_description};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::app_dirs;
use crate::config::LoggingSettings;

/// Launch logs kept in the log directory, newest first.
pub const KEPT_LAUNCH_LOGS: usize = 10;
const LAUNCH_LOG_PREFIX: &str = "lagopus_";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("No log directory configured and no app directory available")]
    NoLogDir,
    #[error("Failed to prepare log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to list launch logs in {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to delete old launch log {path}: {source}")]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to create launch log {path}: {source}")]
    CreateLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to format launch log name: {0}")]
    FormatTime(#[from] time::error::Format),
    #[error("A global tracing subscriber is already installed: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber and return the path of this launch's log.
///
/// `RUST_LOG` takes precedence over `settings.level`. Only the first call
/// installs anything; later calls return an error from `SetGlobal`.
pub fn init(settings: &LoggingSettings) -> Result<PathBuf, LoggingError> {
    let dir = log_dir(settings)?;
    let file_name = launch_log_name(now_local_or_utc())?;
    let path = dir.join(&file_name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| LoggingError::CreateLogFile {
            path: path.clone(),
            source,
        })?;
    prune_launch_logs(&dir, KEPT_LAUNCH_LOGS)?;

    let (file_writer, guard) = tracing_appender::non_blocking(rolling::never(&dir, file_name));
    let timer = local_timer();
    let subscriber = Registry::default()
        .with(env_filter(&settings.level))
        .with(
            fmt::layer()
                .with_timer(timer.clone())
                .with_writer(std::io::stderr),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(file_writer),
        );
    tracing::subscriber::set_global_default(subscriber)?;
    let _ = FILE_GUARD.set(guard);

    tracing::debug!(log = %path.display(), "Logging initialized");
    Ok(path)
}

fn log_dir(settings: &LoggingSettings) -> Result<PathBuf, LoggingError> {
    let Some(dir) = settings.dir.as_deref() else {
        return app_dirs::logs_dir().map_err(|err| match err {
            app_dirs::AppDirError::NoBaseDir => LoggingError::NoLogDir,
            app_dirs::AppDirError::CreateDir { path, source } => {
                LoggingError::CreateDir { path, source }
            }
        });
    };
    fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(dir.to_path_buf())
}

/// Delete the oldest launch logs so at most `keep` remain. Other files in
/// the directory are left alone.
fn prune_launch_logs(dir: &Path, keep: usize) -> Result<(), LoggingError> {
    let listing = fs::read_dir(dir).map_err(|source| LoggingError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut launch_logs: Vec<(SystemTime, PathBuf)> = listing
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter(|entry| is_launch_log(&entry.file_name().to_string_lossy()))
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect();
    launch_logs.sort();
    let excess = launch_logs.len().saturating_sub(keep);
    for (_, path) in launch_logs.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::RemoveFile { path, source })?;
    }
    Ok(())
}

fn is_launch_log(name: &str) -> bool {
    name.starts_with(LAUNCH_LOG_PREFIX) && name.ends_with(".log")
}

fn launch_log_name(now: OffsetDateTime) -> Result<String, LoggingError> {
    const NAME_FORMAT: &[FormatItem<'_>] =
        format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    Ok(format!("{LAUNCH_LOG_PREFIX}{}.log", now.format(NAME_FORMAT)?))
}

fn local_timer() -> fmt::time::OffsetTime<time::format_description::BorrowedFormatItem<'static>> {
    const LINE_FORMAT: &[FormatItem<'static>] =
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    fmt::time::OffsetTime::new(offset, LINE_FORMAT.into())
}

fn now_local_or_utc() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};
    use tempfile::tempdir;

    #[test]
    fn launch_log_name_embeds_timestamp() {
        let fixed = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(
            launch_log_name(fixed).unwrap(),
            "lagopus_2023-11-14_22-13-20.log"
        );
    }

    #[test]
    fn pruning_keeps_newest_launch_logs_and_foreign_files() {
        let dir = tempdir().unwrap();
        for idx in 0..12 {
            fs::write(dir.path().join(format!("lagopus_{idx:02}.log")), b"").unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        fs::write(dir.path().join("fuzzer.log"), b"workload output").unwrap();

        prune_launch_logs(dir.path(), 10).unwrap();
        let remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| is_launch_log(name))
            .collect();
        assert_eq!(remaining.len(), 10);
        assert!(!dir.path().join("lagopus_00.log").exists());
        assert!(!dir.path().join("lagopus_01.log").exists());
        assert!(dir.path().join("fuzzer.log").exists());
    }
}
