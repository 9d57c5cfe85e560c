use rusqlite::Connection;

use super::{StoreError, map_sql_error};

/// Create the job and crash tables when missing.
///
/// `crashes.job_id` references `jobs` but foreign keys stay off: results may
/// be imported for job directories that were created outside the service.
pub(super) fn apply_schema(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                driver TEXT NOT NULL,
                target TEXT NOT NULL,
                cpus INTEGER NOT NULL,
                memory INTEGER NOT NULL,
                deadline INTEGER NOT NULL,
                create_time INTEGER NOT NULL,
                ingest_state TEXT NOT NULL DEFAULT 'pending',
                ingest_claimed_at INTEGER
             );
             CREATE TABLE IF NOT EXISTS crashes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(job_id),
                type TEXT NOT NULL,
                is_crash INTEGER NOT NULL DEFAULT 0,
                is_security_issue INTEGER NOT NULL DEFAULT 0,
                sample_path TEXT NOT NULL,
                backtrace TEXT NOT NULL,
                backtrace_hash TEXT NOT NULL,
                return_code INTEGER,
                create_time INTEGER NOT NULL,
                UNIQUE(job_id, backtrace_hash)
             );
             CREATE INDEX IF NOT EXISTS idx_crashes_job_id ON crashes (job_id, id);",
        )
        .map_err(map_sql_error)
}
