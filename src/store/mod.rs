//! Persistent job queue
//!
//! One SQLite table holds every job. The scheduler is the only writer of
//! status fields; listing commands open the same database read-side. Each
//! operation is atomic at the record level, and status changes are
//! compare-and-set updates that enforce the PENDING → RUNNING →
//! {COMPLETED | FAILED} state machine.

mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::job::{Job, JobFilter, JobId, NewJob};
use crate::state::JobStatus;

use schema::{format_ts, JobRow, JOB_COLUMNS};

pub use schema::SCHEMA_VERSION;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from the job store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("an error message can only be recorded for failed jobs, not {0}")]
    ErrorMessageNotAllowed(JobStatus),

    #[error("job {0} changed status concurrently")]
    ConcurrentUpdate(JobId),

    #[error("corrupt value in column '{column}': {reason}")]
    CorruptRow { column: &'static str, reason: String },

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl StoreError {
    /// Whether this error means the backing store itself is unusable,
    /// as opposed to a rejected request.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(_) | StoreError::Io(_) | StoreError::CorruptRow { .. } | StoreError::SchemaTooNew { .. }
        )
    }
}

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}

/// SQLite-backed job queue
#[derive(Debug)]
pub struct JobStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl JobStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let created = !path.exists();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        schema::install(&conn)?;

        if created {
            tracing::info!(path = %path.display(), "initialized new job database");
            share_with_group(&path);
        }

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Private in-memory database (tests and dry runs)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::install(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// Database file, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Queue a job. It starts PENDING with `created_at` = now.
    pub fn enqueue(&mut self, job: &NewJob) -> StoreResult<JobId> {
        let created_at = format_ts(&Utc::now());
        self.conn.execute(
            "INSERT INTO jobs (program, interpreter_path, environment_name, parameters, status, \
             created_at, owner_user, notify_address) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.program,
                job.interpreter_path,
                job.environment_name,
                job.parameters.to_json(),
                JobStatus::Pending.as_str(),
                created_at,
                job.owner_user,
                job.notify_address,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], JobRow::read)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Oldest PENDING job by (`created_at`, `id`). Does not modify anything.
    pub fn next_pending(&self) -> StoreResult<Option<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
            JOB_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![JobStatus::Pending.as_str()], JobRow::read)
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Move a job along the state machine and return the updated record.
    ///
    /// RUNNING stamps `started_at`; COMPLETED and FAILED stamp
    /// `completed_at`. `error_message` is only accepted for FAILED. Illegal
    /// edges fail with [`StoreError::InvalidTransition`] and leave the record
    /// untouched, including repeats of a transition that already happened.
    pub fn transition(
        &mut self,
        id: JobId,
        to: JobStatus,
        error_message: Option<&str>,
    ) -> StoreResult<Job> {
        if error_message.is_some() && to != JobStatus::Failed {
            return Err(StoreError::ErrorMessageNotAllowed(to));
        }

        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let current = current.ok_or(StoreError::NotFound(id))?;
        let from: JobStatus = current.parse().map_err(|e: crate::state::StatusParseError| {
            StoreError::CorruptRow {
                column: "status",
                reason: e.to_string(),
            }
        })?;

        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition { id, from, to });
        }

        let now = format_ts(&Utc::now());
        let changed = match to {
            JobStatus::Running => tx.execute(
                "UPDATE jobs SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, from.as_str()],
            )?,
            JobStatus::Completed | JobStatus::Failed => tx.execute(
                "UPDATE jobs SET status = ?1, completed_at = ?2, error_message = ?3 \
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), now, error_message, id, from.as_str()],
            )?,
            JobStatus::Pending => 0,
        };
        if changed != 1 {
            return Err(StoreError::ConcurrentUpdate(id));
        }
        tx.commit()?;

        self.get(id)?.ok_or(StoreError::NotFound(id))
    }

    /// Jobs matching `filter`, newest first.
    pub fn list_all(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut sql = format!("SELECT {} FROM jobs WHERE 1 = 1", JOB_COLUMNS);
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(format_ts(&since));
            sql.push_str(&format!(" AND created_at >= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), JobRow::read)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    /// Jobs currently RUNNING (normally zero or one).
    pub fn running(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = self.list_all(&JobFilter::all().with_status(JobStatus::Running))?;
        jobs.reverse();
        Ok(jobs)
    }

    pub fn count_by_status(&self) -> StoreResult<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let mut rows = stmt.query([])?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count.max(0) as u64;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = count,
                Ok(JobStatus::Running) => counts.running = count,
                Ok(JobStatus::Completed) => counts.completed = count,
                Ok(JobStatus::Failed) => counts.failed = count,
                Err(e) => {
                    return Err(StoreError::CorruptRow {
                        column: "status",
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(counts)
    }

    /// Delete every job. Operator action only; ids are not reused afterwards.
    pub fn clear(&mut self) -> StoreResult<usize> {
        let removed = self.conn.execute("DELETE FROM jobs", [])?;
        tracing::info!(removed, "job database cleared");
        Ok(removed)
    }
}

#[cfg(unix)]
fn share_with_group(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o664)) {
        tracing::warn!(path = %path.display(), error = %e, "could not make job database group-writable");
    }
}

#[cfg(not(unix))]
fn share_with_group(_path: &Path) {}
