//! Bounded access to a job's `jobresults.zip`.
//!
//! Only single entries are ever extracted (the crash database or one sample),
//! each flattened to its file name inside a caller-provided directory.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// File name of the crash database written by the workload.
pub const CRASH_DB_NAME: &str = "crashes.db";

const MAX_ENTRIES: usize = 200_000;
const MAX_ENTRY_UNCOMPRESSED_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const MAX_COMPRESSION_RATIO: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: io::Error,
    },
    #[error("Corrupt archive {path}: {message}")]
    Zip { path: PathBuf, message: String },
    #[error("Archive entry not found: {0}")]
    MissingEntry(String),
    #[error("Archive entry has an unsafe path: {0}")]
    UnsafePath(String),
    #[error("Archive rejected: {0}")]
    Invalid(String),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: io::Error,
    },
}

/// Size limits applied before and during extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    pub max_entries: usize,
    pub max_entry_uncompressed_bytes: u64,
    pub max_compression_ratio: u64,
}

impl ExtractionLimits {
    pub fn standard() -> Self {
        Self {
            max_entries: MAX_ENTRIES,
            max_entry_uncompressed_bytes: MAX_ENTRY_UNCOMPRESSED_BYTES,
            max_compression_ratio: MAX_COMPRESSION_RATIO,
        }
    }
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self::standard()
    }
}

/// An opened results archive.
pub struct ResultsArchive {
    path: PathBuf,
    archive: zip::ZipArchive<File>,
    limits: ExtractionLimits,
}

impl ResultsArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        Self::open_with_limits(path, ExtractionLimits::standard())
    }

    pub fn open_with_limits(path: &Path, limits: ExtractionLimits) -> Result<Self, ArchiveError> {
        let file = File::open(path).map_err(|source| ArchiveError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let archive = zip::ZipArchive::new(file).map_err(|err| ArchiveError::Zip {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if archive.len() > limits.max_entries {
            return Err(ArchiveError::Invalid(format!(
                "{} has {} entries, limit is {}",
                path.display(),
                archive.len(),
                limits.max_entries
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            limits,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File entry names in archive order; directory entries are omitted.
    pub fn file_names(&self) -> Vec<String> {
        self.archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    /// Locate the crash database entry.
    ///
    /// When several entries are named `crashes.db` the one with the shortest
    /// path wins, ties broken by name.
    pub fn find_crash_db(&self) -> Option<String> {
        let mut candidates: Vec<String> = self
            .file_names()
            .into_iter()
            .filter(|name| Path::new(name).file_name().is_some_and(|file| file == CRASH_DB_NAME))
            .collect();
        candidates.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        if candidates.len() > 1 {
            warn!(
                archive = %self.path.display(),
                chosen = %candidates[0],
                count = candidates.len(),
                "Multiple crash databases in results archive"
            );
        }
        candidates.into_iter().next()
    }

    /// Locate a sample by file name or by trailing path, first match in
    /// archive order.
    pub fn find_sample(&self, sample: &str) -> Option<String> {
        let sample = sample.trim_start_matches('/');
        if sample.is_empty() {
            return None;
        }
        let suffix = format!("/{sample}");
        self.file_names()
            .into_iter()
            .find(|name| name == sample || name.ends_with(&suffix))
    }

    /// Extract one entry into `dest_dir`, returning the written path.
    pub fn extract_entry(&mut self, name: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let limits = self.limits;
        let mut entry = self.archive.by_name(name).map_err(|err| match err {
            zip::result::ZipError::FileNotFound => ArchiveError::MissingEntry(name.to_string()),
            other => ArchiveError::Zip {
                path: self.path.clone(),
                message: other.to_string(),
            },
        })?;
        check_entry_limits(name, entry.size(), entry.compressed_size(), limits)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath(name.to_string()))?;
        let file_name = relative
            .file_name()
            .ok_or_else(|| ArchiveError::UnsafePath(name.to_string()))?;
        let outpath = dest_dir.join(file_name);
        let write_error = |source| ArchiveError::Write {
            path: outpath.clone(),
            source,
        };
        let mut outfile = File::create(&outpath).map_err(write_error)?;
        let limit = limits.max_entry_uncompressed_bytes;
        let copied = io::copy(&mut (&mut entry).take(limit + 1), &mut outfile).map_err(write_error)?;
        if copied > limit {
            return Err(ArchiveError::Invalid(format!(
                "Entry '{name}' expanded beyond {limit} bytes"
            )));
        }
        Ok(outpath)
    }
}

fn check_entry_limits(
    name: &str,
    uncompressed_size: u64,
    compressed_size: u64,
    limits: ExtractionLimits,
) -> Result<(), ArchiveError> {
    if uncompressed_size > limits.max_entry_uncompressed_bytes {
        return Err(ArchiveError::Invalid(format!(
            "Entry '{name}' is too large ({uncompressed_size} bytes, limit {})",
            limits.max_entry_uncompressed_bytes
        )));
    }
    if uncompressed_size > 0 {
        if compressed_size == 0 {
            return Err(ArchiveError::Invalid(format!(
                "Entry '{name}' has zero compressed size"
            )));
        }
        if uncompressed_size > compressed_size.saturating_mul(limits.max_compression_ratio) {
            return Err(ArchiveError::Invalid(format!(
                "Entry '{name}' exceeds compression ratio limit"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), options).unwrap();
                continue;
            }
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn shortest_crash_db_path_wins() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("jobresults.zip");
        write_zip(
            &zip_path,
            &[
                ("out/nested/crashes.db", b"deep".as_slice()),
                ("out/crashes.db", b"shallow".as_slice()),
                ("out/crashes.db-journal", b"journal".as_slice()),
                ("crashes/id:000", b"sample".as_slice()),
            ],
        );
        let archive = ResultsArchive::open(&zip_path).unwrap();
        assert_eq!(archive.find_crash_db().as_deref(), Some("out/crashes.db"));
    }

    #[test]
    fn archive_without_crash_db_finds_nothing() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("jobresults.zip");
        write_zip(&zip_path, &[("logs/fuzzer.log", b"started")]);
        let archive = ResultsArchive::open(&zip_path).unwrap();
        assert_eq!(archive.find_crash_db(), None);
    }

    #[test]
    fn extracts_entry_flattened_into_dest() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("jobresults.zip");
        write_zip(&zip_path, &[("out/crashes/id:000,sig:11", b"\x00crash")]);
        let mut archive = ResultsArchive::open(&zip_path).unwrap();
        let name = archive.find_sample("id:000,sig:11").unwrap();
        let dest = temp.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let written = archive.extract_entry(&name, &dest).unwrap();
        assert_eq!(written, dest.join("id:000,sig:11"));
        assert_eq!(std::fs::read(written).unwrap(), b"\x00crash");
    }

    #[test]
    fn sample_lookup_matches_trailing_path_only() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("jobresults.zip");
        write_zip(&zip_path, &[("out/crashes/abc", b"1"), ("out/xabc", b"2")]);
        let archive = ResultsArchive::open(&zip_path).unwrap();
        assert_eq!(archive.find_sample("abc").as_deref(), Some("out/crashes/abc"));
        assert_eq!(
            archive.find_sample("crashes/abc").as_deref(),
            Some("out/crashes/abc")
        );
        assert_eq!(archive.find_sample("missing"), None);
    }

    #[test]
    fn rejects_entry_over_size_limit() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("oversize.zip");
        write_zip(&zip_path, &[("crashes.db", &[1u8; 8])]);
        let limits = ExtractionLimits {
            max_entries: 10,
            max_entry_uncompressed_bytes: 4,
            max_compression_ratio: 100,
        };
        let mut archive = ResultsArchive::open_with_limits(&zip_path, limits).unwrap();
        let err = archive.extract_entry("crashes.db", temp.path()).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn rejects_suspicious_compression_ratio() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("ratio.zip");
        let data = vec![b'a'; 4096];
        write_zip(&zip_path, &[("crashes.db", data.as_slice())]);
        let limits = ExtractionLimits {
            max_entries: 10,
            max_entry_uncompressed_bytes: 10_000,
            max_compression_ratio: 2,
        };
        let mut archive = ResultsArchive::open_with_limits(&zip_path, limits).unwrap();
        let err = archive.extract_entry("crashes.db", temp.path()).unwrap_err();
        assert!(err.to_string().contains("compression ratio"));
    }

    #[test]
    fn corrupt_archive_fails_to_open() {
        let temp = tempdir().unwrap();
        let zip_path = temp.path().join("jobresults.zip");
        std::fs::write(&zip_path, b"not a zip").unwrap();
        let err = ResultsArchive::open(&zip_path).err().unwrap();
        assert!(matches!(err, ArchiveError::Zip { .. }));
    }
}
