use std::path::PathBuf;

use rusqlite::{OptionalExtension, Row, params, types::Type};

use super::{StatusBatch, Store, StoreError, map_sql_error};
use crate::jobs::{Driver, Job, JobId, JobStatus, ResourceRequest};

const JOB_COLUMNS: &str =
    "job_id, status, driver, target, cpus, memory, deadline, create_time";

/// Outcome of trying to take the import claim for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestClaim {
    /// This caller now owns the import.
    Claimed,
    /// The job has no row; results came from a directory created elsewhere.
    Untracked,
    /// Another scanner holds an unexpired claim.
    InProgress,
    /// The job's results were already imported.
    Done,
}

impl Store {
    /// Record a newly submitted job. Fails with `Duplicate` when the id exists.
    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.prepare_cached(
            "INSERT INTO jobs (job_id, status, driver, target, cpus, memory, deadline, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .map_err(map_sql_error)?
        .execute(params![
            job.job_id.as_str(),
            job.status.as_str(),
            job.driver.as_str(),
            job.target.to_string_lossy(),
            job.resources.cpus,
            job.resources.memory_mib,
            job.resources.deadline_secs as i64,
            job.create_time,
        ])
        .map_err(map_sql_error)?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.connection()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1");
        let job = conn
            .prepare_cached(&sql)
            .map_err(map_sql_error)?
            .query_row(params![job_id.as_str()], map_job_row)
            .optional()
            .map_err(map_sql_error)?;
        Ok(job)
    }

    /// List every job, oldest first.
    pub fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.connection()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY create_time, job_id");
        let mut stmt = conn.prepare_cached(&sql).map_err(map_sql_error)?;
        let rows = stmt.query_map([], map_job_row).map_err(map_sql_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sql_error)
    }

    /// Run status writes in one transaction, committing when `apply` succeeds.
    pub fn with_status_batch<T>(
        &self,
        apply: impl FnOnce(&mut StatusBatch<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.connection()?;
        let mut batch = StatusBatch::new(&conn)?;
        let value = apply(&mut batch)?;
        batch.commit()?;
        Ok(value)
    }

    /// Take the import claim for `job_id`.
    ///
    /// A claim older than `lease_secs` is treated as abandoned and may be taken
    /// over, so an importer that died mid-way is retried eventually.
    pub fn claim_ingest(
        &self,
        job_id: &JobId,
        now: i64,
        lease_secs: i64,
    ) -> Result<IngestClaim, StoreError> {
        let conn = self.connection()?;
        let changed = conn
            .prepare_cached(
                "UPDATE jobs SET ingest_state = 'importing', ingest_claimed_at = ?2
                 WHERE job_id = ?1
                   AND (ingest_state = 'pending'
                        OR (ingest_state = 'importing' AND ingest_claimed_at <= ?3))",
            )
            .map_err(map_sql_error)?
            .execute(params![job_id.as_str(), now, now.saturating_sub(lease_secs)])
            .map_err(map_sql_error)?;
        if changed == 1 {
            return Ok(IngestClaim::Claimed);
        }
        let state: Option<String> = conn
            .prepare_cached("SELECT ingest_state FROM jobs WHERE job_id = ?1")
            .map_err(map_sql_error)?
            .query_row(params![job_id.as_str()], |row| row.get(0))
            .optional()
            .map_err(map_sql_error)?;
        Ok(match state.as_deref() {
            None => IngestClaim::Untracked,
            Some("done") => IngestClaim::Done,
            Some(_) => IngestClaim::InProgress,
        })
    }

    /// Mark the job's results as imported.
    pub fn finish_ingest(&self, job_id: &JobId) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.prepare_cached(
            "UPDATE jobs SET ingest_state = 'done', ingest_claimed_at = NULL WHERE job_id = ?1",
        )
        .map_err(map_sql_error)?
        .execute(params![job_id.as_str()])
        .map_err(map_sql_error)?;
        Ok(())
    }

    /// Give a claim back so the next tick retries the import.
    pub fn release_ingest(&self, job_id: &JobId) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.prepare_cached(
            "UPDATE jobs SET ingest_state = 'pending', ingest_claimed_at = NULL
             WHERE job_id = ?1 AND ingest_state = 'importing'",
        )
        .map_err(map_sql_error)?
        .execute(params![job_id.as_str()])
        .map_err(map_sql_error)?;
        Ok(())
    }
}

impl StatusBatch<'_> {
    /// Mark every job in scope that is not `Complete` as `Unknown`.
    ///
    /// `None` covers all jobs. Returns the number of rows touched.
    pub fn reset_unsettled(&mut self, scope: Option<&JobId>) -> Result<usize, StoreError> {
        let changed = match scope {
            Some(job_id) => self
                .tx
                .prepare_cached(
                    "UPDATE jobs SET status = ?1 WHERE job_id = ?2 AND status != ?3",
                )
                .map_err(map_sql_error)?
                .execute(params![
                    JobStatus::Unknown.as_str(),
                    job_id.as_str(),
                    JobStatus::Complete.as_str()
                ]),
            None => self
                .tx
                .prepare_cached("UPDATE jobs SET status = ?1 WHERE status != ?2")
                .map_err(map_sql_error)?
                .execute(params![
                    JobStatus::Unknown.as_str(),
                    JobStatus::Complete.as_str()
                ]),
        };
        changed.map_err(map_sql_error)
    }

    /// Write one status; returns false when no stored job has this id.
    pub fn set_status(&mut self, job_id: &JobId, status: JobStatus) -> Result<bool, StoreError> {
        let changed = self
            .tx
            .prepare_cached("UPDATE jobs SET status = ?1 WHERE job_id = ?2")
            .map_err(map_sql_error)?
            .execute(params![status.as_str(), job_id.as_str()])
            .map_err(map_sql_error)?;
        Ok(changed > 0)
    }
}

fn map_job_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let driver_text: String = row.get(2)?;
    let driver = driver_text
        .parse::<Driver>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;
    let status: String = row.get(1)?;
    let target: String = row.get(3)?;
    let deadline: i64 = row.get(6)?;
    Ok(Job {
        job_id: JobId::from_string(row.get::<_, String>(0)?),
        status: JobStatus::from_db(&status),
        driver,
        target: PathBuf::from(target),
        resources: ResourceRequest {
            cpus: row.get(4)?,
            memory_mib: row.get(5)?,
            deadline_secs: deadline.max(0) as u64,
        },
        create_time: row.get(7)?,
    })
}
