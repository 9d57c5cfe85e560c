use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{
    JobDefinition, Orchestrator, OrchestratorError, OrchestratorJob, OrchestratorStatus,
    ReportedResources, SubmissionReceipt,
};
use crate::jobs::JobId;

/// In-process orchestrator for tests and offline runs.
///
/// Submitted jobs start `Incomplete` with one active pod. Tests drive state
/// with [`InMemoryOrchestrator::set_status`] and inject failures with
/// [`InMemoryOrchestrator::set_offline`] and
/// [`InMemoryOrchestrator::reject_next_submit`].
#[derive(Debug, Default)]
pub struct InMemoryOrchestrator {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<(String, String), OrchestratorJob>,
    submitted: Vec<JobDefinition>,
    offline: bool,
    reject_next: Option<String>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn reject_next_submit(&self, message: impl Into<String>) {
        self.lock().reject_next = Some(message.into());
    }

    /// Change a job's reported status; returns false when the job is unknown.
    pub fn set_status(&self, namespace: &str, job_id: &JobId, status: OrchestratorStatus) -> bool {
        let mut state = self.lock();
        match state.jobs.get_mut(&key(namespace, job_id.as_str())) {
            Some(job) => {
                job.status = status;
                if status == OrchestratorStatus::Complete {
                    job.active_pods = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Drop a job as if the cluster garbage collected it.
    pub fn forget(&self, namespace: &str, job_id: &JobId) -> bool {
        self.lock()
            .jobs
            .remove(&key(namespace, job_id.as_str()))
            .is_some()
    }

    /// Every definition accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<JobDefinition> {
        self.lock().submitted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("orchestrator state lock poisoned")
    }
}

impl Orchestrator for InMemoryOrchestrator {
    fn ping(&self) -> Result<(), OrchestratorError> {
        self.lock().check_online()
    }

    fn submit(&self, definition: &JobDefinition) -> Result<SubmissionReceipt, OrchestratorError> {
        let mut state = self.lock();
        state.check_online()?;
        if let Some(message) = state.reject_next.take() {
            return Err(OrchestratorError::Rejected {
                status: 422,
                message,
            });
        }
        let name = definition.job_id.as_str().to_string();
        let job_key = key(&definition.namespace, &name);
        if state.jobs.contains_key(&job_key) {
            return Err(OrchestratorError::Rejected {
                status: 409,
                message: format!("job {name} already exists"),
            });
        }
        state.jobs.insert(
            job_key,
            OrchestratorJob {
                name: name.clone(),
                status: OrchestratorStatus::Incomplete,
                driver: Some(definition.driver),
                resources: ReportedResources {
                    cpu: Some(definition.resources.cpus.to_string()),
                    memory: Some(format!("{}Mi", definition.resources.memory_mib)),
                    deadline_secs: Some(definition.resources.deadline_secs),
                },
                pod_names: vec![format!("{name}-pod")],
                active_pods: 1,
                start_time: None,
            },
        );
        state.submitted.push(definition.clone());
        Ok(SubmissionReceipt { name, uid: None })
    }

    fn list(
        &self,
        filter: Option<&JobId>,
        namespace: &str,
    ) -> Result<Vec<OrchestratorJob>, OrchestratorError> {
        let state = self.lock();
        state.check_online()?;
        Ok(state
            .jobs
            .iter()
            .filter(|((ns, name), _)| {
                ns == namespace && filter.is_none_or(|job_id| job_id.as_str() == name)
            })
            .map(|(_, job)| job.clone())
            .collect())
    }

    fn terminate(&self, job_id: &JobId, namespace: &str) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        state.check_online()?;
        state
            .jobs
            .remove(&key(namespace, job_id.as_str()))
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))
    }
}

impl MemoryState {
    fn check_online(&self) -> Result<(), OrchestratorError> {
        if self.offline {
            Err(OrchestratorError::Connection("orchestrator offline".into()))
        } else {
            Ok(())
        }
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Driver;
    use crate::orchestrator::tests::definition;

    #[test]
    fn submit_list_and_terminate() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.submit(&definition("a", Driver::Afl)).unwrap();
        orchestrator.submit(&definition("b", Driver::LibFuzzer)).unwrap();

        let all = orchestrator.list(None, "fuzz").unwrap();
        assert_eq!(all.len(), 2);
        assert!(orchestrator.list(None, "other").unwrap().is_empty());
        let only_b = orchestrator
            .list(Some(&JobId::from_string("b")), "fuzz")
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].driver, Some(Driver::LibFuzzer));

        orchestrator.terminate(&JobId::from_string("a"), "fuzz").unwrap();
        let err = orchestrator
            .terminate(&JobId::from_string("a"), "fuzz")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[test]
    fn duplicate_names_and_injected_failures_are_rejected() {
        let orchestrator = InMemoryOrchestrator::new();
        orchestrator.submit(&definition("a", Driver::Afl)).unwrap();
        let dup = orchestrator.submit(&definition("a", Driver::Afl)).unwrap_err();
        assert!(matches!(dup, OrchestratorError::Rejected { status: 409, .. }));

        orchestrator.reject_next_submit("quota exceeded");
        assert!(orchestrator.submit(&definition("b", Driver::Afl)).is_err());
        orchestrator.submit(&definition("b", Driver::Afl)).unwrap();

        orchestrator.set_offline(true);
        assert!(matches!(
            orchestrator.ping(),
            Err(OrchestratorError::Connection(_))
        ));
        assert!(orchestrator.list(None, "fuzz").is_err());
    }
}
