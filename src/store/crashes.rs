use rusqlite::{Row, params};

use super::{CrashRecord, InsertOutcome, NewCrash, Store, StoreError, map_sql_error};
use crate::jobs::JobId;

const CRASH_COLUMNS: &str = "id, job_id, type, is_crash, is_security_issue, sample_path, \
                             backtrace, backtrace_hash, return_code, create_time";

impl Store {
    /// Insert a crash unless `(job_id, backtrace_hash)` is already stored.
    pub fn insert_crash(&self, crash: &NewCrash) -> Result<InsertOutcome, StoreError> {
        let conn = self.connection()?;
        let changed = conn
            .prepare_cached(
                "INSERT INTO crashes (job_id, type, is_crash, is_security_issue, sample_path,
                                      backtrace, backtrace_hash, return_code, create_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(job_id, backtrace_hash) DO NOTHING",
            )
            .map_err(map_sql_error)?
            .execute(params![
                crash.job_id.as_str(),
                crash.crash_type,
                crash.is_crash,
                crash.is_security_issue,
                crash.sample_path,
                crash.backtrace,
                crash.backtrace_hash,
                crash.return_code,
                crash.create_time,
            ])
            .map_err(map_sql_error)?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    /// List crashes in insertion order, optionally restricted to one job.
    pub fn list_crashes(&self, job_id: Option<&JobId>) -> Result<Vec<CrashRecord>, StoreError> {
        let conn = self.connection()?;
        let crashes = match job_id {
            Some(job_id) => {
                let sql = format!("SELECT {CRASH_COLUMNS} FROM crashes WHERE job_id = ?1 ORDER BY id");
                let mut stmt = conn.prepare_cached(&sql).map_err(map_sql_error)?;
                let rows = stmt
                    .query_map(params![job_id.as_str()], map_crash_row)
                    .map_err(map_sql_error)?;
                rows.collect::<Result<Vec<_>, _>>()
            }
            None => {
                let sql = format!("SELECT {CRASH_COLUMNS} FROM crashes ORDER BY id");
                let mut stmt = conn.prepare_cached(&sql).map_err(map_sql_error)?;
                let rows = stmt.query_map([], map_crash_row).map_err(map_sql_error)?;
                rows.collect::<Result<Vec<_>, _>>()
            }
        };
        crashes.map_err(map_sql_error)
    }

    pub fn count_crashes(&self, job_id: &JobId) -> Result<usize, StoreError> {
        let conn = self.connection()?;
        let count: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM crashes WHERE job_id = ?1")
            .map_err(map_sql_error)?
            .query_row(params![job_id.as_str()], |row| row.get(0))
            .map_err(map_sql_error)?;
        Ok(count.max(0) as usize)
    }
}

fn map_crash_row(row: &Row<'_>) -> rusqlite::Result<CrashRecord> {
    Ok(CrashRecord {
        id: row.get(0)?,
        job_id: JobId::from_string(row.get::<_, String>(1)?),
        crash_type: row.get(2)?,
        is_crash: row.get(3)?,
        is_security_issue: row.get(4)?,
        sample_path: row.get(5)?,
        backtrace: row.get(6)?,
        backtrace_hash: row.get(7)?,
        return_code: row.get(8)?,
        create_time: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash(job: &str, hash: &str, sample: &str) -> NewCrash {
        NewCrash {
            job_id: JobId::from_string(job),
            crash_type: "SEGV".to_string(),
            is_crash: true,
            is_security_issue: false,
            sample_path: sample.to_string(),
            backtrace: format!("#0 frame for {hash}"),
            backtrace_hash: hash.to_string(),
            return_code: Some(-11),
            create_time: 1_600_000_000,
        }
    }

    #[test]
    fn duplicate_hash_within_job_is_skipped() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            store.insert_crash(&crash("job-a", "h1", "id:000")).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_crash(&crash("job-a", "h1", "id:001")).unwrap(),
            InsertOutcome::Duplicate
        );
        let stored = store.list_crashes(Some(&JobId::from_string("job-a"))).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sample_path, "id:000");
        assert_eq!(stored[0].return_code, Some(-11));
    }

    #[test]
    fn same_hash_in_other_job_is_kept() {
        let store = Store::open_in_memory().unwrap();
        store.insert_crash(&crash("job-a", "h1", "a")).unwrap();
        assert_eq!(
            store.insert_crash(&crash("job-b", "h1", "b")).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(store.list_crashes(None).unwrap().len(), 2);
        assert_eq!(store.count_crashes(&JobId::from_string("job-b")).unwrap(), 1);
    }

    #[test]
    fn null_return_code_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let mut record = crash("job-a", "h2", "s");
        record.return_code = None;
        store.insert_crash(&record).unwrap();
        let stored = store.list_crashes(None).unwrap();
        assert_eq!(stored[0].return_code, None);
    }
}
