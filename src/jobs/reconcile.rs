//! Status reconciliation between the orchestrator and the store.
//!
//! Runs on every job read. Jobs the orchestrator no longer reports (garbage
//! collected, deleted by hand) end up `Unknown` unless they already reached
//! `Complete`, which is never downgraded by the reset.

use serde::Serialize;
use tracing::{debug, warn};

use super::{Job, JobId, JobStatus};
use crate::orchestrator::Orchestrator;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope<'a> {
    All,
    Job(&'a JobId),
}

impl<'a> ReconcileScope<'a> {
    fn job(self) -> Option<&'a JobId> {
        match self {
            ReconcileScope::All => None,
            ReconcileScope::Job(job_id) => Some(job_id),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Whether the orchestrator answered; when false nothing was written.
    pub reconciled: bool,
    pub reset: usize,
    pub applied: usize,
}

pub struct StatusReconciler<'a> {
    store: &'a Store,
    orchestrator: &'a dyn Orchestrator,
    namespace: &'a str,
}

impl<'a> StatusReconciler<'a> {
    pub fn new(store: &'a Store, orchestrator: &'a dyn Orchestrator, namespace: &'a str) -> Self {
        Self {
            store,
            orchestrator,
            namespace,
        }
    }

    /// Refresh stored statuses in `scope` from the orchestrator.
    ///
    /// An orchestrator failure is logged and leaves the store untouched; only
    /// store failures are returned.
    pub fn reconcile(&self, scope: ReconcileScope<'_>) -> Result<ReconcileOutcome, StoreError> {
        let reported = match self.orchestrator.list(scope.job(), self.namespace) {
            Ok(reported) => reported,
            Err(err) => {
                warn!(error = %err, "Orchestrator unavailable, serving last known job status");
                return Ok(ReconcileOutcome::default());
            }
        };
        self.store.with_status_batch(|batch| {
            let reset = batch.reset_unsettled(scope.job())?;
            let mut applied = 0;
            for job in &reported {
                let job_id = JobId::from_string(job.name.as_str());
                if batch.set_status(&job_id, JobStatus::from(job.status))? {
                    applied += 1;
                } else {
                    debug!(job = %job.name, "Orchestrator reports a job the store does not know");
                }
            }
            Ok(ReconcileOutcome {
                reconciled: true,
                reset,
                applied,
            })
        })
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        self.reconcile(ReconcileScope::Job(job_id))?;
        self.store.get_job(job_id)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.reconcile(ReconcileScope::All)?;
        self.store.list_jobs()
    }
}
