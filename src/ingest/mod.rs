//! Crash ingestion: finding finished jobs and importing their crash databases.

pub mod archive;
pub mod crash_db;
pub mod importer;
pub mod scanner;

pub use archive::{ArchiveError, CRASH_DB_NAME, ResultsArchive};
pub use crash_db::{AnalysisEntry, CrashDatabase, CrashDbError};
pub use importer::{CrashImporter, ImportError, ImportReport, backtrace_hash};
pub use scanner::{ResultScanner, ScanError, ScanOptions, ScanStats};
