//! Table layout and row mapping for the `jobs` table

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};

use crate::job::{Job, Parameters};
use crate::state::JobStatus;

use super::StoreError;

/// Current schema version (PRAGMA user_version)
pub const SCHEMA_VERSION: i64 = 1;

/// Column list shared by every SELECT so row mapping stays in one place.
pub const JOB_COLUMNS: &str = "id, program, interpreter_path, environment_name, parameters, \
     status, created_at, started_at, completed_at, error_message, owner_user, notify_address";

/// `AUTOINCREMENT` keeps ids from being reused even after every row has been
/// deleted by `clear()`.
pub fn install(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            program TEXT NOT NULL,
            interpreter_path TEXT NOT NULL,
            environment_name TEXT,
            parameters TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            owner_user TEXT,
            notify_address TEXT
        );
        CREATE INDEX IF NOT EXISTS jobs_status_created ON jobs(status, created_at, id);",
    )?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
    }
    Ok(())
}

/// Fixed-width UTC timestamps sort lexicographically in time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(column: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            column,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn parse_opt_ts(column: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_ts(column, &r)).transpose()
}

/// Raw column values, read inside rusqlite's row callback.
pub struct JobRow {
    id: i64,
    program: String,
    interpreter_path: String,
    environment_name: Option<String>,
    parameters: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    owner_user: Option<String>,
    notify_address: Option<String>,
}

impl JobRow {
    pub fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            program: row.get(1)?,
            interpreter_path: row.get(2)?,
            environment_name: row.get(3)?,
            parameters: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            error_message: row.get(9)?,
            owner_user: row.get(10)?,
            notify_address: row.get(11)?,
        })
    }

    pub fn into_job(self) -> Result<Job, StoreError> {
        let status: JobStatus = self.status.parse().map_err(|e: crate::state::StatusParseError| {
            StoreError::CorruptRow {
                column: "status",
                reason: e.to_string(),
            }
        })?;
        let parameters = Parameters::from_json_str(&self.parameters).map_err(|e| StoreError::CorruptRow {
            column: "parameters",
            reason: e.to_string(),
        })?;

        Ok(Job {
            id: self.id,
            program: self.program,
            interpreter_path: self.interpreter_path,
            environment_name: self.environment_name,
            parameters,
            status,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at)?,
            error_message: self.error_message,
            owner_user: self.owner_user,
            notify_address: self.notify_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::microseconds(1);
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(format_ts(&early).len(), format_ts(&late).len());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        assert_eq!(parse_ts("created_at", &format_ts(&ts)).unwrap(), ts);
        assert!(parse_ts("created_at", "yesterday").is_err());
    }
}
