//! Cluster orchestrator seam.
//!
//! The orchestrator is the source of truth for whether a job is still running.
//! [`kube::KubeOrchestrator`] talks to the Kubernetes API; [`memory::InMemoryOrchestrator`]
//! backs tests and offline runs.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::jobs::{Driver, JobId, JobStatus, ResourceRequest};

pub mod kube;
pub mod memory;

pub use kube::KubeOrchestrator;
pub use memory::InMemoryOrchestrator;

/// Container name used for the fuzzing workload.
pub const WORKLOAD_CONTAINER: &str = "lagopus-fuzzer";
/// Label carried by every job and pod the service creates.
pub const APP_LABEL: &str = "lagopus";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    /// The API could not be reached or the transport failed.
    #[error("Orchestrator unreachable: {0}")]
    Connection(String),
    /// The API answered with an error status.
    #[error("Orchestrator rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Orchestrator has no job named {0}")]
    NotFound(String),
    /// The API answered with something that could not be understood.
    #[error("Unexpected orchestrator response: {0}")]
    Decode(String),
    #[error("Invalid orchestrator configuration: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestratorError::Connection(_) => true,
            OrchestratorError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Completion state as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorStatus {
    Complete,
    Incomplete,
}

impl From<OrchestratorStatus> for JobStatus {
    fn from(status: OrchestratorStatus) -> Self {
        match status {
            OrchestratorStatus::Complete => JobStatus::Complete,
            OrchestratorStatus::Incomplete => JobStatus::Incomplete,
        }
    }
}

/// Resources as the orchestrator reports them, in its own units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportedResources {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub deadline_secs: Option<u64>,
}

/// A job as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorJob {
    pub name: String,
    pub status: OrchestratorStatus,
    /// `None` when the workload carries no recognizable driver.
    pub driver: Option<Driver>,
    pub resources: ReportedResources,
    pub pod_names: Vec<String>,
    pub active_pods: u32,
    pub start_time: Option<String>,
}

/// Acknowledgement of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub name: String,
    pub uid: Option<String>,
}

/// Everything needed to launch one fuzzing workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub job_id: JobId,
    pub driver: Driver,
    pub resources: ResourceRequest,
    pub namespace: String,
    /// Job directory relative to the shared volume root, e.g. `jobs/<id>`.
    pub target_ref: PathBuf,
    pub image: String,
    /// Persistent volume claim holding the jobs tree.
    pub volume_claim: String,
    /// Where the claim is mounted inside the workload container.
    pub mount_path: PathBuf,
}

impl JobDefinition {
    /// Render the `batch/v1` Job manifest for this definition.
    pub fn manifest(&self) -> Value {
        let name = self.job_id.as_str();
        let quantity = json!({
            "cpu": self.resources.cpus.to_string(),
            "memory": format!("{}Mi", self.resources.memory_mib),
        });
        let labels = json!({ "app": APP_LABEL, "lagopus/job-id": name });
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": labels,
            },
            "spec": {
                "activeDeadlineSeconds": self.resources.deadline_secs,
                "backoffLimit": 0,
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": WORKLOAD_CONTAINER,
                            "image": self.image,
                            "env": [
                                { "name": "DRIVER", "value": self.driver.as_str() },
                                { "name": "JOB_ID", "value": name },
                                { "name": "JOB_PATH", "value": self.target_ref.to_string_lossy() },
                                { "name": "DEADLINE", "value": self.resources.deadline_secs.to_string() },
                            ],
                            "resources": { "requests": quantity, "limits": quantity },
                            "volumeMounts": [{
                                "name": "jobs",
                                "mountPath": self.mount_path.to_string_lossy(),
                            }],
                        }],
                        "volumes": [{
                            "name": "jobs",
                            "persistentVolumeClaim": { "claimName": self.volume_claim },
                        }],
                    },
                },
            },
        })
    }
}

/// A cluster that runs fuzzing jobs.
pub trait Orchestrator: Send + Sync {
    /// Check that the orchestrator answers.
    fn ping(&self) -> Result<(), OrchestratorError>;

    fn submit(&self, definition: &JobDefinition) -> Result<SubmissionReceipt, OrchestratorError>;

    /// List jobs in `namespace`, or only `filter` when given. No match is an
    /// empty list, not an error.
    fn list(
        &self,
        filter: Option<&JobId>,
        namespace: &str,
    ) -> Result<Vec<OrchestratorJob>, OrchestratorError>;

    /// Delete a job and, in the background, its pods.
    fn terminate(&self, job_id: &JobId, namespace: &str) -> Result<(), OrchestratorError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn definition(id: &str, driver: Driver) -> JobDefinition {
        JobDefinition {
            job_id: JobId::from_string(id),
            driver,
            resources: ResourceRequest {
                cpus: 2,
                memory_mib: 200,
                deadline_secs: 240,
            },
            namespace: "fuzz".to_string(),
            target_ref: PathBuf::from(format!("jobs/{id}")),
            image: "lagopus-fuzzer:test".to_string(),
            volume_claim: "lagopus-jobs".to_string(),
            mount_path: PathBuf::from("/lagopus"),
        }
    }

    #[test]
    fn manifest_carries_driver_resources_and_deadline() {
        let manifest = definition("png.afl.2020-01-01-00-00-00", Driver::Afl).manifest();
        assert_eq!(manifest["metadata"]["name"], "png.afl.2020-01-01-00-00-00");
        assert_eq!(manifest["metadata"]["namespace"], "fuzz");
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 240);
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["env"][0]["name"], "DRIVER");
        assert_eq!(container["env"][0]["value"], "afl");
        assert_eq!(container["env"][2]["value"], "jobs/png.afl.2020-01-01-00-00-00");
        assert_eq!(container["resources"]["requests"]["cpu"], "2");
        assert_eq!(container["resources"]["requests"]["memory"], "200Mi");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "lagopus-jobs"
        );
    }

    #[test]
    fn transient_errors_are_connection_and_server_side() {
        assert!(OrchestratorError::Connection("reset".into()).is_transient());
        assert!(
            OrchestratorError::Rejected {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !OrchestratorError::Rejected {
                status: 409,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!OrchestratorError::NotFound("x".into()).is_transient());
    }
}
