//! Job lifecycle operations composed over the store and an orchestrator.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use super::identity::{IdentityError, generate_id};
use super::reconcile::StatusReconciler;
use super::target::{TargetError, validate_target};
use super::workdir::{JobDir, WorkdirError};
use super::{Driver, Job, JobId, JobStatus, ResourceRequest, UnknownDriver};
use crate::config::LagopusConfig;
use crate::ingest::archive::{ArchiveError, ResultsArchive};
use crate::orchestrator::{JobDefinition, Orchestrator, OrchestratorError};
use crate::store::{CrashRecord, Store, StoreError};

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error(transparent)]
    UnknownDriver(#[from] UnknownDriver),
    #[error("Invalid job name: {0}")]
    Identity(#[from] IdentityError),
    #[error("Job directory already exists for {0}")]
    Exists(JobId),
    #[error("Failed to copy target archive from {path}: {source}")]
    CopyTarget {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid target archive: {0}")]
    InvalidTarget(#[from] TargetError),
    #[error("Failed to render job descriptor: {0}")]
    Render(String),
    #[error("Job submission failed: {0}")]
    Submission(OrchestratorError),
    #[error("No such job: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Orchestrator(OrchestratorError),
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Parameters of a job creation request; unset resources use config defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub driver: String,
    pub target: PathBuf,
    pub cpus: Option<u32>,
    pub memory_mib: Option<u32>,
    pub deadline_secs: Option<u64>,
}

pub struct JobService<'a> {
    store: &'a Store,
    orchestrator: &'a dyn Orchestrator,
    config: &'a LagopusConfig,
}

impl<'a> JobService<'a> {
    pub fn new(
        store: &'a Store,
        orchestrator: &'a dyn Orchestrator,
        config: &'a LagopusConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    fn namespace(&self) -> &'a str {
        &self.config.orchestrator.namespace
    }

    fn reconciler(&self) -> StatusReconciler<'a> {
        StatusReconciler::new(self.store, self.orchestrator, self.namespace())
    }

    pub fn create(&self, request: &JobRequest) -> Result<Job, JobServiceError> {
        self.create_at(request, OffsetDateTime::now_utc())
    }

    /// Create, validate and submit a job as of `now`.
    ///
    /// Nothing is recorded unless submission succeeds, and the job directory
    /// is removed on any failure up to and including submission.
    pub fn create_at(
        &self,
        request: &JobRequest,
        now: OffsetDateTime,
    ) -> Result<Job, JobServiceError> {
        let driver: Driver = request.driver.parse()?;
        let job_id = generate_id(&request.name, driver.as_str(), now)?;
        let defaults = self.config.job_defaults;
        let resources = ResourceRequest {
            cpus: request.cpus.unwrap_or(defaults.cpus),
            memory_mib: request.memory_mib.unwrap_or(defaults.memory_mib),
            deadline_secs: request.deadline_secs.unwrap_or(defaults.deadline_secs),
        };
        let dir = JobDir::new(&self.config.dirs.jobs, &job_id);
        if dir.path().exists() {
            return Err(JobServiceError::Exists(job_id));
        }
        dir.create()?;
        info!(job = %job_id, dir = %dir.path().display(), "Created job directory");

        let job = Job {
            job_id: job_id.clone(),
            driver,
            resources,
            status: JobStatus::Created,
            create_time: now.unix_timestamp(),
            target: dir.target_path(),
        };
        if let Err(err) = self.prepare_and_submit(&dir, &job, &request.target) {
            discard_dir(&dir);
            return Err(err);
        }
        if let Err(err) = self.store.insert_job(&job) {
            warn!(job = %job_id, error = %err, "Failed to record submitted job, terminating it");
            if let Err(terminate) = self.orchestrator.terminate(&job_id, self.namespace()) {
                warn!(job = %job_id, error = %terminate, "Failed to terminate unrecorded job");
            }
            discard_dir(&dir);
            return Err(err.into());
        }
        info!(job = %job_id, driver = %driver, "Job submitted");
        Ok(job)
    }

    fn prepare_and_submit(
        &self,
        dir: &JobDir,
        job: &Job,
        source: &Path,
    ) -> Result<(), JobServiceError> {
        fs::copy(source, dir.target_path()).map_err(|err| JobServiceError::CopyTarget {
            path: source.to_path_buf(),
            source: err,
        })?;
        validate_target(&dir.target_path(), job.driver)?;

        let definition = self.definition(job);
        let descriptor = serde_yaml::to_string(&definition.manifest())
            .map_err(|err| JobServiceError::Render(err.to_string()))?;
        fs::write(dir.descriptor_path(), descriptor).map_err(|source| {
            JobServiceError::Workdir(WorkdirError::Io {
                path: dir.descriptor_path(),
                source,
            })
        })?;
        self.orchestrator
            .submit(&definition)
            .map_err(JobServiceError::Submission)?;
        Ok(())
    }

    fn definition(&self, job: &Job) -> JobDefinition {
        let dirs = &self.config.dirs;
        let job_dir = dirs.jobs.join(job.job_id.as_str());
        let target_ref = job_dir
            .strip_prefix(&dirs.base)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| Path::new("jobs").join(job.job_id.as_str()));
        let settings = &self.config.orchestrator;
        JobDefinition {
            job_id: job.job_id.clone(),
            driver: job.driver,
            resources: job.resources,
            namespace: settings.namespace.clone(),
            target_ref,
            image: settings.image.clone(),
            volume_claim: settings.jobs_claim.clone(),
            mount_path: dirs.base.clone(),
        }
    }

    /// Fetch one job after reconciling its status.
    pub fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError> {
        Ok(self.reconciler().get_job(job_id)?)
    }

    /// List all jobs after reconciling their status.
    pub fn list(&self) -> Result<Vec<Job>, JobServiceError> {
        Ok(self.reconciler().list_jobs()?)
    }

    /// Stop a running job. Stored status history is kept.
    pub fn kill(&self, job_id: &JobId) -> Result<(), JobServiceError> {
        match self.orchestrator.terminate(job_id, self.namespace()) {
            Ok(()) => {
                info!(job = %job_id, "Job terminated");
                Ok(())
            }
            Err(OrchestratorError::NotFound(_)) => Err(JobServiceError::NotFound(job_id.clone())),
            Err(err) => Err(JobServiceError::Orchestrator(err)),
        }
    }

    /// Path of the job's results archive, if the workload produced one.
    pub fn result_archive(&self, job_id: &JobId) -> Option<PathBuf> {
        result_archive(&self.config.dirs.jobs, job_id)
    }

    pub fn crashes(&self, job_id: Option<&JobId>) -> Result<Vec<CrashRecord>, JobServiceError> {
        Ok(self.store.list_crashes(job_id)?)
    }

    /// Extract one sample from the job's results into `dest_dir`.
    ///
    /// Returns `None` when the job has no results or the sample is absent.
    pub fn extract_sample(
        &self,
        job_id: &JobId,
        sample: &str,
        dest_dir: &Path,
    ) -> Result<Option<PathBuf>, JobServiceError> {
        extract_sample(&self.config.dirs.jobs, job_id, sample, dest_dir)
    }
}

/// Path of the job's `jobresults.zip` under `jobs_root`, if the job finished.
pub fn result_archive(jobs_root: &Path, job_id: &JobId) -> Option<PathBuf> {
    let dir = JobDir::new(jobs_root, job_id);
    dir.has_results().then(|| dir.results_path())
}

/// Sample extraction needs only the shared volume, so the CLI calls this
/// without a store or orchestrator.
pub fn extract_sample(
    jobs_root: &Path,
    job_id: &JobId,
    sample: &str,
    dest_dir: &Path,
) -> Result<Option<PathBuf>, JobServiceError> {
    let Some(results) = result_archive(jobs_root, job_id) else {
        return Ok(None);
    };
    let mut archive = ResultsArchive::open(&results)?;
    let Some(entry) = archive.find_sample(sample) else {
        return Ok(None);
    };
    fs::create_dir_all(dest_dir).map_err(|source| {
        JobServiceError::Workdir(WorkdirError::Io {
            path: dest_dir.to_path_buf(),
            source,
        })
    })?;
    Ok(Some(archive.extract_entry(&entry, dest_dir)?))
}

fn discard_dir(dir: &JobDir) {
    if let Err(err) = dir.remove() {
        warn!(dir = %dir.path().display(), error = %err, "Failed to remove job directory");
    }
}
