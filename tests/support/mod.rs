#![allow(dead_code)]

use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use lagopus::config::LagopusConfig;
use rusqlite::{Connection, params};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct ConfigHomeGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl ConfigHomeGuard {
    pub fn set(path: PathBuf) -> Self {
        let lock = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let previous = std::env::var(lagopus::app_dirs::CONFIG_HOME_ENV).ok();
        // SAFETY: tests run under a global lock to prevent concurrent env mutations.
        unsafe {
            std::env::set_var(lagopus::app_dirs::CONFIG_HOME_ENV, path);
        }
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for ConfigHomeGuard {
    fn drop(&mut self) {
        // SAFETY: tests run under a global lock to prevent concurrent env mutations.
        unsafe {
            match self.previous.take() {
                Some(value) => std::env::set_var(lagopus::app_dirs::CONFIG_HOME_ENV, value),
                None => std::env::remove_var(lagopus::app_dirs::CONFIG_HOME_ENV),
            }
        }
    }
}

/// Config whose shared volume lives under `root`.
pub fn config_under(root: &Path) -> LagopusConfig {
    let mut config = LagopusConfig::default();
    config.dirs.base = root.to_path_buf();
    config.dirs.jobs = root.join("jobs");
    config.store.path = root.join("lagopus.db");
    std::fs::create_dir_all(&config.dirs.jobs).unwrap();
    config
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
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

/// Minimal valid target archive for either driver.
pub fn write_target(path: &Path) {
    write_zip(
        path,
        &[
            ("corpus/", b"".as_slice()),
            ("corpus/seed", b"seed".as_slice()),
            ("target", b"\x7fELF".as_slice()),
            ("target.conf", b"[afl.dirs]".as_slice()),
        ],
    );
}

/// One analysis row as a fuzzing workload writes it.
pub struct AnalysisRow<'a> {
    pub sample: &'a str,
    pub crash_type: Option<&'a str>,
    pub backtrace: Option<&'a str>,
    pub should_ignore: bool,
    pub return_code: i32,
}

impl<'a> AnalysisRow<'a> {
    pub fn crash(sample: &'a str, backtrace: &'a str) -> Self {
        Self {
            sample,
            crash_type: Some("SEGV"),
            backtrace: Some(backtrace),
            should_ignore: false,
            return_code: -11,
        }
    }
}

/// Build the bytes of an embedded crash database holding `rows`.
pub fn crash_db_bytes(rows: &[AnalysisRow<'_>]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crashes.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE analysis (
            sample TEXT, type TEXT, is_crash INTEGER, is_security_issue INTEGER,
            should_ignore INTEGER, backtrace TEXT, return_code INTEGER, hash TEXT)",
    )
    .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO analysis VALUES (?1, ?2, 1, 0, ?3, ?4, ?5, NULL)",
            params![
                row.sample,
                row.crash_type,
                row.should_ignore,
                row.backtrace,
                row.return_code
            ],
        )
        .unwrap();
    }
    drop(conn);
    std::fs::read(&path).unwrap()
}

/// Drop a results archive with an embedded crash database into `job_dir`.
pub fn write_results(job_dir: &Path, rows: &[AnalysisRow<'_>]) {
    let db = crash_db_bytes(rows);
    let mut entries: Vec<(&str, &[u8])> = vec![("out/crashes.db", db.as_slice())];
    let samples: Vec<String> = rows
        .iter()
        .map(|row| format!("out/crashes/{}", row.sample))
        .collect();
    for sample in &samples {
        entries.push((sample.as_str(), b"crash input".as_slice()));
    }
    write_zip(&job_dir.join("jobresults.zip"), &entries);
}
