use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::archive::{ArchiveError, ExtractionLimits, ResultsArchive};
use super::crash_db::CrashDatabase;
use super::importer::{CrashImporter, ImportError, ImportReport};
use crate::classifier::Classifier;
use crate::jobs::workdir::{self, JobDir, WorkdirError};
use crate::store::{IngestClaim, Store, StoreError};

const DEFAULT_INGEST_LEASE: Duration = Duration::from_secs(30 * 60);
const STOP_POLL: Duration = Duration::from_millis(200);

/// Errors that stop a whole scan pass.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
}

/// Errors confined to one job directory.
#[derive(Debug, Error)]
enum JobScanError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
    #[error("Failed to create scratch directory: {0}")]
    Scratch(std::io::Error),
}

/// Counts for one scan pass.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanStats {
    pub job_dirs: usize,
    pub already_scanned: usize,
    /// Jobs whose results archive does not exist yet.
    pub pending: usize,
    /// Jobs another scanner is importing right now.
    pub claimed_elsewhere: usize,
    pub without_crash_db: usize,
    pub imported_jobs: usize,
    pub crashes_imported: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed_entries: usize,
    pub failed_jobs: usize,
    /// Entries a dry pass found and would have imported.
    pub would_import: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// How long an import claim stays valid before another scanner may take it.
    pub ingest_lease: Duration,
    pub limits: ExtractionLimits,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ingest_lease: DEFAULT_INGEST_LEASE,
            limits: ExtractionLimits::standard(),
        }
    }
}

enum JobOutcome {
    AlreadyScanned,
    Pending,
    ClaimedElsewhere,
    NoCrashDb,
    Imported(ImportReport),
    Unreadable,
    WouldImport(usize),
}

/// Walks the jobs root and imports finished jobs' crashes exactly once.
pub struct ResultScanner<'a> {
    jobs_root: PathBuf,
    store: Option<&'a Store>,
    classifier: &'a dyn Classifier,
    options: ScanOptions,
}

impl<'a> ResultScanner<'a> {
    /// Scanner that exports crashes into `store` and writes scan markers.
    pub fn new(jobs_root: impl Into<PathBuf>, store: &'a Store, classifier: &'a dyn Classifier) -> Self {
        Self {
            jobs_root: jobs_root.into(),
            store: Some(store),
            classifier,
            options: ScanOptions::default(),
        }
    }

    /// Scanner that only reports what it would import. Nothing is written.
    pub fn dry_run(jobs_root: impl Into<PathBuf>, classifier: &'a dyn Classifier) -> Self {
        Self {
            jobs_root: jobs_root.into(),
            store: None,
            classifier,
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn jobs_root(&self) -> &Path {
        &self.jobs_root
    }

    /// Run one pass over every job directory.
    ///
    /// Failures in one job are logged and counted; only an unreadable jobs
    /// root fails the pass.
    pub fn scan_once(&self) -> Result<ScanStats, ScanError> {
        let dirs = workdir::list_job_dirs(&self.jobs_root)?;
        let mut stats = ScanStats {
            job_dirs: dirs.len(),
            ..ScanStats::default()
        };
        for dir in &dirs {
            match self.scan_job(dir) {
                Ok(outcome) => record(&mut stats, outcome),
                Err(err) => {
                    warn!(job = %dir.job_id(), error = %err, "Failed to scan job results");
                    stats.failed_jobs += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Scan every `interval` until `stop` is set.
    pub fn run(&self, interval: Duration, stop: &AtomicBool) {
        info!(
            root = %self.jobs_root.display(),
            interval_secs = interval.as_secs(),
            export = self.store.is_some(),
            "Result scanner started"
        );
        while !stop.load(Ordering::Relaxed) {
            match self.scan_once() {
                Ok(stats) => {
                    if stats.imported_jobs > 0 || stats.failed_jobs > 0 {
                        info!(
                            imported_jobs = stats.imported_jobs,
                            crashes = stats.crashes_imported,
                            failed_jobs = stats.failed_jobs,
                            "Scan pass finished"
                        );
                    } else {
                        debug!(job_dirs = stats.job_dirs, "Scan pass found nothing new");
                    }
                }
                Err(err) => warn!(error = %err, "Scan pass failed"),
            }
            sleep_unless_stopped(interval, stop);
        }
        info!("Result scanner stopped");
    }

    fn scan_job(&self, dir: &JobDir) -> Result<JobOutcome, JobScanError> {
        if dir.is_scanned() {
            return Ok(JobOutcome::AlreadyScanned);
        }
        if !dir.has_results() {
            return Ok(JobOutcome::Pending);
        }
        let Some(store) = self.store else {
            return self.preview_job(dir);
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let lease = i64::try_from(self.options.ingest_lease.as_secs()).unwrap_or(i64::MAX);
        match store.claim_ingest(dir.job_id(), now, lease)? {
            IngestClaim::InProgress => return Ok(JobOutcome::ClaimedElsewhere),
            IngestClaim::Done => {
                dir.mark_scanned()?;
                return Ok(JobOutcome::AlreadyScanned);
            }
            IngestClaim::Claimed | IngestClaim::Untracked => {}
        }
        match self.import_job(dir, store, now) {
            Ok(outcome) => {
                dir.mark_scanned()?;
                store.finish_ingest(dir.job_id())?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(release) = store.release_ingest(dir.job_id()) {
                    warn!(job = %dir.job_id(), error = %release, "Failed to release import claim");
                }
                Err(err)
            }
        }
    }

    /// Errors returned here leave the job unmarked so the next pass retries it.
    fn import_job(&self, dir: &JobDir, store: &Store, now: i64) -> Result<JobOutcome, JobScanError> {
        let mut archive = ResultsArchive::open_with_limits(&dir.results_path(), self.options.limits)?;
        let Some(entry) = archive.find_crash_db() else {
            info!(job = %dir.job_id(), "Results archive has no crash database");
            return Ok(JobOutcome::NoCrashDb);
        };
        let scratch = tempfile::tempdir().map_err(JobScanError::Scratch)?;
        let db_path = archive.extract_entry(&entry, scratch.path())?;
        let importer = CrashImporter::new(store, self.classifier);
        let imported = CrashDatabase::open(&db_path)
            .map_err(ImportError::from)
            .and_then(|db| importer.import(dir.job_id(), &db, now));
        match imported {
            Ok(report) => {
                info!(
                    job = %dir.job_id(),
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    ignored = report.ignored,
                    failed = report.failed,
                    "Imported crashes"
                );
                Ok(JobOutcome::Imported(report))
            }
            Err(err) => {
                error!(job = %dir.job_id(), error = %err, "Crash database unreadable");
                Ok(JobOutcome::Unreadable)
            }
        }
    }

    fn preview_job(&self, dir: &JobDir) -> Result<JobOutcome, JobScanError> {
        let mut archive = ResultsArchive::open_with_limits(&dir.results_path(), self.options.limits)?;
        let Some(entry) = archive.find_crash_db() else {
            return Ok(JobOutcome::NoCrashDb);
        };
        let scratch = tempfile::tempdir().map_err(JobScanError::Scratch)?;
        let db_path = archive.extract_entry(&entry, scratch.path())?;
        let count = match CrashDatabase::open(&db_path).and_then(|db| db.entries()) {
            Ok(entries) => entries.iter().filter(|entry| entry.is_ok()).count(),
            Err(err) => {
                warn!(job = %dir.job_id(), error = %err, "Crash database unreadable");
                return Ok(JobOutcome::Unreadable);
            }
        };
        info!(job = %dir.job_id(), entries = count, "Would import crashes");
        Ok(JobOutcome::WouldImport(count))
    }
}

fn record(stats: &mut ScanStats, outcome: JobOutcome) {
    match outcome {
        JobOutcome::AlreadyScanned => stats.already_scanned += 1,
        JobOutcome::Pending => stats.pending += 1,
        JobOutcome::ClaimedElsewhere => stats.claimed_elsewhere += 1,
        JobOutcome::NoCrashDb => stats.without_crash_db += 1,
        JobOutcome::Imported(report) => {
            stats.imported_jobs += 1;
            stats.crashes_imported += report.inserted;
            stats.duplicates += report.duplicates;
            stats.ignored += report.ignored;
            stats.failed_entries += report.failed;
        }
        JobOutcome::Unreadable => stats.failed_jobs += 1,
        JobOutcome::WouldImport(count) => stats.would_import += count,
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ExitStatusClassifier;
    use crate::ingest::archive::tests::write_zip;
    use crate::ingest::crash_db::tests::ANALYSIS_DDL;
    use crate::jobs::JobId;
    use crate::jobs::workdir::JOB_DESCRIPTOR;
    use rusqlite::Connection;
    use std::fs;
    use tempfile::tempdir;

    fn crash_db_bytes(rows: &[&str]) -> Vec<u8> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crashes.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(ANALYSIS_DDL).unwrap();
        for row in rows {
            conn.execute(&format!("INSERT INTO analysis VALUES ({row})"), [])
                .unwrap();
        }
        drop(conn);
        fs::read(&path).unwrap()
    }

    fn job_dir(root: &Path, id: &str) -> JobDir {
        let dir = JobDir::new(root, &JobId::from_string(id));
        dir.create().unwrap();
        fs::write(dir.descriptor_path(), "kind: Job\n").unwrap();
        dir
    }

    #[test]
    fn imports_once_then_skips_marked_job() {
        let root = tempdir().unwrap();
        let dir = job_dir(root.path(), "done");
        let db = crash_db_bytes(&["'s1', 'SEGV', 1, 0, 0, 'bt', -11, NULL"]);
        write_zip(&dir.results_path(), &[("out/crashes.db", db.as_slice())]);
        job_dir(root.path(), "running");

        let store = Store::open_in_memory().unwrap();
        let scanner = ResultScanner::new(root.path(), &store, &ExitStatusClassifier);
        let first = scanner.scan_once().unwrap();
        assert_eq!(first.job_dirs, 2);
        assert_eq!(first.imported_jobs, 1);
        assert_eq!(first.crashes_imported, 1);
        assert_eq!(first.pending, 1);
        assert!(dir.is_scanned());

        let second = scanner.scan_once().unwrap();
        assert_eq!(second.already_scanned, 1);
        assert_eq!(second.imported_jobs, 0);
        assert_eq!(store.list_crashes(None).unwrap().len(), 1);
    }

    #[test]
    fn archive_without_crash_db_is_marked() {
        let root = tempdir().unwrap();
        let dir = job_dir(root.path(), "empty");
        write_zip(&dir.results_path(), &[("logs/run.log", b"ok")]);
        let store = Store::open_in_memory().unwrap();
        let stats = ResultScanner::new(root.path(), &store, &ExitStatusClassifier)
            .scan_once()
            .unwrap();
        assert_eq!(stats.without_crash_db, 1);
        assert!(dir.is_scanned());
    }

    #[test]
    fn corrupt_archive_is_retried_next_pass() {
        let root = tempdir().unwrap();
        let dir = job_dir(root.path(), "partial");
        fs::write(dir.results_path(), b"PK truncated").unwrap();
        let store = Store::open_in_memory().unwrap();
        let scanner = ResultScanner::new(root.path(), &store, &ExitStatusClassifier);
        let stats = scanner.scan_once().unwrap();
        assert_eq!(stats.failed_jobs, 1);
        assert!(!dir.is_scanned());

        let db = crash_db_bytes(&["'s1', 'SEGV', 1, 0, 0, 'bt', -11, NULL"]);
        write_zip(&dir.results_path(), &[("crashes.db", db.as_slice())]);
        let retry = scanner.scan_once().unwrap();
        assert_eq!(retry.imported_jobs, 1);
        assert!(dir.is_scanned());
    }

    #[test]
    fn dry_run_reports_without_marking() {
        let root = tempdir().unwrap();
        let dir = job_dir(root.path(), "preview");
        let db = crash_db_bytes(&[
            "'s1', 'SEGV', 1, 0, 0, 'bt', -11, NULL",
            "'s2', 'SEGV', 1, 0, 0, 'bt2', -11, NULL",
        ]);
        write_zip(&dir.results_path(), &[("crashes.db", db.as_slice())]);
        let stats = ResultScanner::dry_run(root.path(), &ExitStatusClassifier)
            .scan_once()
            .unwrap();
        assert_eq!(stats.would_import, 2);
        assert!(!dir.is_scanned());
    }

    #[test]
    fn run_returns_once_stop_is_set() {
        let root = tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let scanner = ResultScanner::new(root.path(), &store, &ExitStatusClassifier);
        let stop = AtomicBool::new(false);
        let started = Instant::now();
        thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                stop.store(true, Ordering::Relaxed);
            });
            scanner.run(Duration::from_secs(3600), &stop);
        });
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
