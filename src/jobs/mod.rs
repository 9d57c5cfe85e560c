use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod identity;
pub mod reconcile;
pub mod service;
pub mod target;
pub mod workdir;

pub use identity::{IdentityError, generate_id};
pub use reconcile::{ReconcileOutcome, ReconcileScope, StatusReconciler};
pub use service::{JobRequest, JobService, JobServiceError, extract_sample, result_archive};
pub use workdir::JobDir;

/// Identifier of a fuzzing job; doubles as the orchestrator resource name
/// and the name of the job's working directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Rehydrate an identifier from a stored string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fuzzing engine the workload runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Afl,
    LibFuzzer,
}

impl Driver {
    pub fn as_str(self) -> &'static str {
        match self {
            Driver::Afl => "afl",
            Driver::LibFuzzer => "libfuzzer",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown fuzzing driver: {0}")]
pub struct UnknownDriver(pub String);

impl FromStr for Driver {
    type Err = UnknownDriver;

    /// Accepts any casing, so `libFuzzer` and `AFL` parse.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "afl" => Ok(Driver::Afl),
            "libfuzzer" => Ok(Driver::LibFuzzer),
            _ => Err(UnknownDriver(value.to_string())),
        }
    }
}

/// Stored lifecycle status of a job.
///
/// `Created` is only ever written at submission time. Every later transition
/// comes from reconciliation against the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Unknown,
    Incomplete,
    Complete,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "Created",
            JobStatus::Unknown => "Unknown",
            JobStatus::Incomplete => "Incomplete",
            JobStatus::Complete => "Complete",
        }
    }

    /// Parse a stored status column. Unrecognized values read as `Unknown`.
    pub fn from_db(value: &str) -> Self {
        match value {
            "Created" => JobStatus::Created,
            "Incomplete" => JobStatus::Incomplete,
            "Complete" => JobStatus::Complete,
            _ => JobStatus::Unknown,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources requested from the orchestrator for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: u32,
    pub memory_mib: u32,
    /// Maximum runtime of the fuzzing step.
    pub deadline_secs: u64,
}

/// Durable record of a job as kept by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub driver: Driver,
    pub resources: ResourceRequest,
    pub status: JobStatus,
    /// Creation time in epoch seconds.
    pub create_time: i64,
    /// Stored target archive.
    pub target: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_parses_any_casing() {
        assert_eq!("afl".parse::<Driver>().unwrap(), Driver::Afl);
        assert_eq!("AFL".parse::<Driver>().unwrap(), Driver::Afl);
        assert_eq!("libFuzzer".parse::<Driver>().unwrap(), Driver::LibFuzzer);
        assert_eq!(" libfuzzer ".parse::<Driver>().unwrap(), Driver::LibFuzzer);
        let err = "honggfuzz".parse::<Driver>().unwrap_err();
        assert_eq!(err, UnknownDriver("honggfuzz".to_string()));
    }

    #[test]
    fn status_round_trips_through_db_text() {
        for status in [
            JobStatus::Created,
            JobStatus::Unknown,
            JobStatus::Incomplete,
            JobStatus::Complete,
        ] {
            assert_eq!(JobStatus::from_db(status.as_str()), status);
        }
        assert_eq!(JobStatus::from_db("Running"), JobStatus::Unknown);
    }

    #[test]
    fn job_id_serializes_as_plain_string() {
        let id = JobId::from_string("png.afl.2024-01-02-03-04-05");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"png.afl.2024-01-02-03-04-05\"");
    }
}
