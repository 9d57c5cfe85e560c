//! SQLite-backed job and crash store.
//!
//! One `Store` owns one connection behind a mutex and is handed by reference
//! to the reconciler, the scanner and the job service. Every access runs a
//! cheap health check first and reopens a file-backed connection that has
//! gone bad.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::JobId;

/// Crash row queries and inserts.
pub mod crashes;
/// Job row queries, status batches and the ingest claim.
pub mod jobs;
/// Schema creation for the store database.
pub mod schema;

pub use jobs::IngestClaim;

/// A crash as stored, one per unique `(job_id, backtrace_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub id: i64,
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub crash_type: String,
    pub is_crash: bool,
    pub is_security_issue: bool,
    /// Sample path as recorded by the workload, relative to its output dir.
    pub sample_path: String,
    pub backtrace: String,
    pub backtrace_hash: String,
    pub return_code: Option<i32>,
    /// Epoch seconds.
    pub create_time: i64,
}

/// Crash data ready to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCrash {
    pub job_id: JobId,
    pub crash_type: String,
    pub is_crash: bool,
    pub is_security_issue: bool,
    pub sample_path: String,
    pub backtrace: String,
    pub backtrace_hash: String,
    pub return_code: Option<i32>,
    pub create_time: i64,
}

/// Result of inserting a crash under the `(job_id, backtrace_hash)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Errors returned by the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite query failed.
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    /// Failed to create the directory holding the database file.
    #[error("Could not write to {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Database is locked or busy.
    #[error("Database is busy, please retry")]
    Busy,
    /// A uniqueness constraint rejected the write.
    #[error("Record already exists")]
    Duplicate,
    /// The connection failed its health check and could not be reopened.
    #[error("Database connection unavailable: {0}")]
    Unavailable(String),
    /// SQLite returned an unexpected result.
    #[error("SQLite returned an unexpected result")]
    Unexpected,
}

/// Shared handle to the job and crash tables.
pub struct Store {
    path: Option<PathBuf>,
    connection: Mutex<Connection>,
}

/// Groups job status writes into one transaction.
pub struct StatusBatch<'conn> {
    tx: Transaction<'conn>,
}

impl Store {
    /// Open (or create) the store at `path`, applying pragmas and schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        create_parent_if_needed(path)?;
        let connection = open_connection(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            connection: Mutex::new(connection),
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory().map_err(map_sql_error)?;
        schema::apply_schema(&connection)?;
        Ok(Self {
            path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Verify the connection answers a trivial query.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.connection().map(|_| ())
    }

    /// Lock the connection, reopening it if the health check fails.
    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        let mut guard = self
            .connection
            .lock()
            .expect("store connection lock poisoned");
        if let Err(err) = health_check(&guard) {
            let Some(path) = self.path.as_deref() else {
                return Err(StoreError::Unavailable(err.to_string()));
            };
            tracing::warn!(path = %path.display(), error = %err, "Store health check failed, reconnecting");
            *guard = open_connection(path)
                .map_err(|reopen| StoreError::Unavailable(reopen.to_string()))?;
        }
        Ok(guard)
    }
}

impl<'conn> StatusBatch<'conn> {
    pub(crate) fn new(connection: &'conn Connection) -> Result<Self, StoreError> {
        let tx = connection.unchecked_transaction().map_err(map_sql_error)?;
        Ok(Self { tx })
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().map_err(map_sql_error)
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let connection = Connection::open(path).map_err(map_sql_error)?;
    apply_pragmas(&connection)?;
    schema::apply_schema(&connection)?;
    Ok(connection)
}

fn apply_pragmas(connection: &Connection) -> Result<(), StoreError> {
    connection
        .execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout=5000;
             PRAGMA temp_store=MEMORY;",
        )
        .map_err(map_sql_error)
}

fn health_check(connection: &Connection) -> Result<(), StoreError> {
    connection
        .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(map_sql_error)
}

fn create_parent_if_needed(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Translate rusqlite errors into friendlier StoreError variants.
pub(crate) fn map_sql_error(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(sql_err, _)
            if sql_err.code == rusqlite::ErrorCode::DatabaseBusy
                || sql_err.code == rusqlite::ErrorCode::DatabaseLocked =>
        {
            StoreError::Busy
        }
        rusqlite::Error::SqliteFailure(sql_err, _)
            if sql_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || sql_err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::Duplicate
        }
        rusqlite::Error::InvalidQuery
        | rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::MultipleStatement => StoreError::Unexpected,
        other => StoreError::Sql(other),
    }
}
