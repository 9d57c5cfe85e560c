//! Reader for the `crashes.db` file produced by the fuzzing workload.
//!
//! The workload writes one `analysis` row per crashing input. Column types are
//! loose (booleans may be integers or text), so every value is read through
//! [`rusqlite::types::Value`] and coerced here.

use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, Row};
use thiserror::Error;

const ANALYSIS_TABLE: &str = "analysis";
const REQUIRED_COLUMNS: [&str; 7] = [
    "sample",
    "type",
    "is_crash",
    "is_security_issue",
    "should_ignore",
    "backtrace",
    "return_code",
];

const SELECT_WITH_HASH: &str = "SELECT sample, type, is_crash, is_security_issue, should_ignore, \
                                backtrace, return_code, hash FROM analysis ORDER BY rowid";
const SELECT_WITHOUT_HASH: &str = "SELECT sample, type, is_crash, is_security_issue, \
                                   should_ignore, backtrace, return_code, NULL FROM analysis \
                                   ORDER BY rowid";

#[derive(Debug, Error)]
pub enum CrashDbError {
    #[error("Failed to open crash database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("Crash database has no `{ANALYSIS_TABLE}` table")]
    MissingTable,
    #[error("Crash database is missing column `{0}`")]
    MissingColumn(&'static str),
    #[error("Crash database query failed: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Malformed analysis row {row}: {message}")]
    MalformedRow { row: usize, message: String },
}

/// One row of the `analysis` table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnalysisEntry {
    pub sample: String,
    /// Crash type reported by the workload's analyzer, if it ran.
    pub crash_type: Option<String>,
    pub is_crash: bool,
    pub is_security_issue: bool,
    pub should_ignore: bool,
    pub backtrace: Option<String>,
    pub return_code: Option<i32>,
    /// Precomputed backtrace hash, when the workload provides one.
    pub hash: Option<String>,
}

/// A read-only handle on an extracted `crashes.db`.
pub struct CrashDatabase {
    connection: Connection,
}

impl CrashDatabase {
    pub fn open(path: &Path) -> Result<Self, CrashDbError> {
        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| CrashDbError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { connection })
    }

    /// Read every analysis row.
    ///
    /// The outer error means the database is unusable. Inner errors are per
    /// row so one malformed entry does not hide the rest.
    pub fn entries(&self) -> Result<Vec<Result<AnalysisEntry, CrashDbError>>, CrashDbError> {
        let columns = self.analysis_columns()?;
        if columns.is_empty() {
            return Err(CrashDbError::MissingTable);
        }
        for required in REQUIRED_COLUMNS {
            if !columns.iter().any(|column| column == required) {
                return Err(CrashDbError::MissingColumn(required));
            }
        }
        let sql = if columns.iter().any(|column| column == "hash") {
            SELECT_WITH_HASH
        } else {
            SELECT_WITHOUT_HASH
        };
        let mut stmt = self.connection.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        let mut index = 0usize;
        while let Some(row) = rows.next()? {
            entries.push(read_entry(row, index));
            index += 1;
        }
        Ok(entries)
    }

    fn analysis_columns(&self) -> Result<Vec<String>, CrashDbError> {
        let mut stmt = self
            .connection
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names = stmt
            .query_map([ANALYSIS_TABLE], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

fn read_entry(row: &Row<'_>, index: usize) -> Result<AnalysisEntry, CrashDbError> {
    let malformed = |message: String| CrashDbError::MalformedRow {
        row: index,
        message,
    };
    let value = |idx: usize| -> Result<Value, CrashDbError> {
        row.get::<_, Value>(idx)
            .map_err(|err| malformed(err.to_string()))
    };
    let sample = as_text(value(0)?).ok_or_else(|| malformed("sample is missing".into()))?;
    let return_code = match value(6)? {
        Value::Null => None,
        Value::Integer(code) => Some(
            i32::try_from(code).map_err(|_| malformed(format!("return code {code} out of range")))?,
        ),
        Value::Text(text) => Some(
            text.trim()
                .parse::<i32>()
                .map_err(|_| malformed(format!("return code '{text}' is not a number")))?,
        ),
        other => return Err(malformed(format!("return code has type {:?}", other.data_type()))),
    };
    Ok(AnalysisEntry {
        sample,
        crash_type: as_text(value(1)?).filter(|text| !text.trim().is_empty()),
        is_crash: as_flag(value(2)?),
        is_security_issue: as_flag(value(3)?),
        should_ignore: as_flag(value(4)?),
        backtrace: as_text(value(5)?),
        return_code,
        hash: as_text(value(7)?).filter(|text| !text.is_empty()),
    })
}

fn as_text(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        Value::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Integer(number) => Some(number.to_string()),
        Value::Real(number) => Some(number.to_string()),
        Value::Null => None,
    }
}

fn as_flag(value: Value) -> bool {
    match value {
        Value::Integer(number) => number != 0,
        Value::Real(number) => number != 0.0,
        Value::Text(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        ),
        Value::Blob(_) | Value::Null => false,
    }
}
