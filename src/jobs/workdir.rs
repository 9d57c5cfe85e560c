//! Per-job working directory layout under the jobs root.
//!
//! ```text
//! <jobs_root>/<job_id>/
//!     target.zip      uploaded target archive
//!     job.yaml        rendered workload manifest; marks the dir as a job
//!     jobresults.zip  written by the workload when it finishes
//!     .scanned        written by the scanner once results are imported
//! ```

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use super::JobId;

pub const TARGET_ARCHIVE: &str = "target.zip";
pub const JOB_DESCRIPTOR: &str = "job.yaml";
pub const RESULTS_ARCHIVE: &str = "jobresults.zip";
pub const SCAN_MARKER: &str = ".scanned";

#[derive(Debug, Error)]
pub enum WorkdirError {
    #[error("Jobs root is not a directory: {0}")]
    InvalidRoot(PathBuf),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle to one job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDir {
    job_id: JobId,
    path: PathBuf,
}

impl JobDir {
    pub fn new(jobs_root: &Path, job_id: &JobId) -> Self {
        Self {
            job_id: job_id.clone(),
            path: jobs_root.join(job_id.as_str()),
        }
    }

    /// Wrap an existing directory; the job id is its final path component.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Some(Self {
            job_id: JobId::from_string(name),
            path: path.to_path_buf(),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target_path(&self) -> PathBuf {
        self.path.join(TARGET_ARCHIVE)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.path.join(JOB_DESCRIPTOR)
    }

    pub fn results_path(&self) -> PathBuf {
        self.path.join(RESULTS_ARCHIVE)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.path.join(SCAN_MARKER)
    }

    /// A directory is a job only when its descriptor exists.
    pub fn is_job(&self) -> bool {
        self.descriptor_path().is_file()
    }

    pub fn has_results(&self) -> bool {
        self.results_path().is_file()
    }

    pub fn is_scanned(&self) -> bool {
        self.marker_path().exists()
    }

    /// Create the directory, readable and writable by the workload's user.
    pub fn create(&self) -> Result<(), WorkdirError> {
        fs::create_dir_all(&self.path).map_err(|source| self.io_error(&self.path, source))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o777))
                .map_err(|source| self.io_error(&self.path, source))?;
        }
        Ok(())
    }

    /// Write the scan marker; an existing marker is left as is.
    pub fn mark_scanned(&self) -> Result<(), WorkdirError> {
        let marker = self.marker_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&marker)
            .map(|_| ())
            .map_err(|source| self.io_error(&marker, source))
    }

    /// Remove the directory and everything in it.
    pub fn remove(&self) -> Result<(), WorkdirError> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(&self.path, source)),
        }
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> WorkdirError {
        WorkdirError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// List the job directories directly under `jobs_root`, sorted by name.
///
/// Entries that are not directories, symlinks, and directories without a
/// descriptor are skipped. Unreadable entries are logged and skipped.
pub fn list_job_dirs(jobs_root: &Path) -> Result<Vec<JobDir>, WorkdirError> {
    if !jobs_root.is_dir() {
        return Err(WorkdirError::InvalidRoot(jobs_root.to_path_buf()));
    }
    let entries = fs::read_dir(jobs_root).map_err(|source| WorkdirError::Io {
        path: jobs_root.to_path_buf(),
        source,
    })?;
    let mut dirs = Vec::new();
    for entry_result in entries {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    dir = %jobs_root.display(),
                    error = %err,
                    "Failed to read jobs root entry"
                );
                continue;
            }
        };
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read file type");
                continue;
            }
        };
        if !file_type.is_dir() {
            continue;
        }
        let Some(dir) = JobDir::from_path(&path) else {
            warn!(path = %path.display(), "Skipping job directory with non UTF-8 name");
            continue;
        };
        if dir.is_job() {
            dirs.push(dir);
        }
    }
    dirs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lists_only_dirs_with_descriptor() {
        let root = tempdir().unwrap();
        for name in ["b-job", "a-job"] {
            let dir = root.path().join(name);
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join(JOB_DESCRIPTOR), "kind: Job\n").unwrap();
        }
        fs::create_dir(root.path().join("no-descriptor")).unwrap();
        fs::write(root.path().join("stray.txt"), "x").unwrap();

        let dirs = list_job_dirs(root.path()).unwrap();
        let names: Vec<&str> = dirs.iter().map(|dir| dir.job_id().as_str()).collect();
        assert_eq!(names, vec!["a-job", "b-job"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = tempdir().unwrap();
        let err = list_job_dirs(&root.path().join("absent")).unwrap_err();
        assert!(matches!(err, WorkdirError::InvalidRoot(_)));
    }

    #[test]
    fn marker_is_idempotent_and_remove_tolerates_missing_dir() {
        let root = tempdir().unwrap();
        let dir = JobDir::new(root.path(), &JobId::from_string("j"));
        dir.create().unwrap();
        assert!(!dir.is_scanned());
        dir.mark_scanned().unwrap();
        dir.mark_scanned().unwrap();
        assert!(dir.is_scanned());
        dir.remove().unwrap();
        assert!(!dir.path().exists());
        dir.remove().unwrap();
    }
}
