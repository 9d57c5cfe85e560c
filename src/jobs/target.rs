use std::fs::File;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Driver;

const CORPUS_DIR: &str = "corpus/";
const TARGET_BINARY: &str = "target";
const AFL_CONFIG: &str = "target.conf";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Failed to open target archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Target archive is not a valid zip: {0}")]
    Zip(String),
    #[error("No corpus directory")]
    MissingCorpus,
    #[error("corpus is not a directory")]
    CorpusNotDir,
    #[error("No target binary")]
    MissingTarget,
    #[error("target is a directory")]
    TargetIsDir,
    #[error("Fuzzing driver is AFL, but no afl-multicore config file named 'target.conf' found")]
    MissingAflConfig,
}

/// Check that a target archive has what the workload needs to start.
///
/// A `corpus/` directory is accepted either as an explicit directory entry or
/// implied by entries beneath it.
pub fn validate_target(path: &Path, driver: Driver) -> Result<(), TargetError> {
    let file = File::open(path).map_err(|source| TargetError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let archive = zip::ZipArchive::new(file).map_err(|err| TargetError::Zip(err.to_string()))?;
    let names: Vec<&str> = archive.file_names().collect();

    let has_corpus = names.iter().any(|name| name.starts_with(CORPUS_DIR));
    if !has_corpus {
        return Err(if names.contains(&"corpus") {
            TargetError::CorpusNotDir
        } else {
            TargetError::MissingCorpus
        });
    }
    if !names.contains(&TARGET_BINARY) {
        return Err(if names.contains(&"target/") {
            TargetError::TargetIsDir
        } else {
            TargetError::MissingTarget
        });
    }
    if driver == Driver::Afl && !names.contains(&AFL_CONFIG) {
        return Err(TargetError::MissingAflConfig);
    }
    Ok(())
}
