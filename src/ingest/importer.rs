use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::crash_db::{AnalysisEntry, CrashDatabase, CrashDbError};
use crate::classifier::{Classifier, CrashInput};
use crate::jobs::JobId;
use crate::store::{InsertOutcome, NewCrash, Store};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    CrashDb(#[from] CrashDbError),
}

/// Per-database import counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Crash type stored for untyped entries that have no exit status either.
pub const UNKNOWN_CRASH_TYPE: &str = "UNKNOWN";

/// SHA-256 hex digest of a backtrace; the deduplication key for crashes.
pub fn backtrace_hash(backtrace: &str) -> String {
    format!("{:x}", Sha256::digest(backtrace.as_bytes()))
}

/// Copies analysis rows from an extracted crash database into the store.
pub struct CrashImporter<'a> {
    store: &'a Store,
    classifier: &'a dyn Classifier,
}

impl<'a> CrashImporter<'a> {
    pub fn new(store: &'a Store, classifier: &'a dyn Classifier) -> Self {
        Self { store, classifier }
    }

    /// Import every entry of `db` under `job_id`.
    ///
    /// Entries are independent: a malformed row or a failed insert is counted
    /// and logged, and the remaining rows still import. Only an unreadable
    /// database fails the whole call.
    pub fn import(
        &self,
        job_id: &JobId,
        db: &CrashDatabase,
        now: i64,
    ) -> Result<ImportReport, ImportError> {
        let mut report = ImportReport::default();
        for entry in db.entries()? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(job = %job_id, error = %err, "Skipping unreadable crash entry");
                    report.failed += 1;
                    continue;
                }
            };
            let Some(crash) = self.prepare(job_id, entry, now) else {
                report.ignored += 1;
                continue;
            };
            match self.store.insert_crash(&crash) {
                Ok(InsertOutcome::Inserted) => report.inserted += 1,
                Ok(InsertOutcome::Duplicate) => {
                    debug!(job = %job_id, hash = %crash.backtrace_hash, "Duplicate crash");
                    report.duplicates += 1;
                }
                Err(err) => {
                    warn!(
                        job = %job_id,
                        sample = %crash.sample_path,
                        error = %err,
                        "Failed to store crash"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Build the stored crash for one entry, or `None` when it should be ignored.
    fn prepare(&self, job_id: &JobId, entry: AnalysisEntry, now: i64) -> Option<NewCrash> {
        if entry.should_ignore {
            return None;
        }
        let raw_backtrace = entry.backtrace.unwrap_or_default();
        let (crash_type, is_crash, is_security_issue, backtrace) =
            match (entry.crash_type, entry.return_code) {
                (Some(crash_type), _) => (
                    crash_type,
                    entry.is_crash,
                    entry.is_security_issue,
                    raw_backtrace,
                ),
                // Without an exit status there is nothing to classify on.
                (None, None) => (
                    UNKNOWN_CRASH_TYPE.to_string(),
                    entry.is_crash,
                    entry.is_security_issue,
                    raw_backtrace,
                ),
                (None, Some(exit_code)) => {
                    let verdict = self.classifier.classify(&CrashInput {
                        output: raw_backtrace.clone(),
                        exit_code,
                        timestamp: now,
                    });
                    if verdict.should_ignore {
                        return None;
                    }
                    let backtrace = if verdict.stacktrace.is_empty() {
                        raw_backtrace
                    } else {
                        verdict.stacktrace
                    };
                    (
                        verdict.crash_type,
                        verdict.is_crash,
                        verdict.is_security_issue,
                        backtrace,
                    )
                }
            };
        let backtrace_hash = entry
            .hash
            .unwrap_or_else(|| backtrace_hash(&backtrace));
        Some(NewCrash {
            job_id: job_id.clone(),
            crash_type,
            is_crash,
            is_security_issue,
            sample_path: entry.sample,
            backtrace,
            backtrace_hash,
            return_code: entry.return_code,
            create_time: now,
        })
    }
}
