use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::{self, fmt_ts, parse_opt_ts, parse_ts};
use crate::error::{QueueError, Result};
use crate::types::{Job, JobFilter, JobStats, JobStatus, NewJob, Priority};

/// What a conditional delete found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// The row exists but is claimed by a worker; left untouched.
    Processing,
    NotFound,
}

/// Counts from one lease-recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Returned to pending, attempts left.
    pub requeued: usize,
    /// Out of attempts, marked failed.
    pub failed: usize,
}

/// Durable storage for job records.
///
/// Every mutating method is a single conditional statement (or one
/// transaction), so the store stays correct when several engines, threads
/// or processes share it. Methods returning `bool` report whether the
/// condition matched; `false` means someone else got there first.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Due pending jobs that have never run, best first.
    fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Due pending jobs returned by a failed attempt, best first.
    fn find_retryable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Every due pending job regardless of attempts, best first.
    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Pending → Processing compare-and-swap. Bumps `attempts`.
    ///
    /// Returns the row as claimed, or `None` when zero rows matched (another
    /// worker won, or the job was cancelled or rescheduled meanwhile).
    fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    // The outcome methods take the `attempts` value returned by `claim` as a
    // fencing token: a claim that was reclaimed by lease recovery and claimed
    // again no longer matches, so a late outcome from it is dropped.

    fn mark_completed(&self, id: &str, attempt: u32, now: DateTime<Utc>) -> Result<bool>;

    /// Processing → Pending with the next attempt pushed to `retry_at`.
    fn mark_retrying(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    fn mark_failed(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete unless the job is processing.
    fn remove(&self, id: &str) -> Result<Removal>;

    /// Failed → fresh Pending.
    fn reset_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Delete terminal jobs last touched before `cutoff`.
    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Reclaim jobs processing since before `cutoff`.
    fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery>;

    fn stats(&self) -> Result<JobStats>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    fn job_types(&self) -> Result<Vec<String>>;
}

const JOB_COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts,
     scheduled_at, error_message, started_at, completed_at, created_at, updated_at";

/// Ties on priority and creation time fall back to insertion order.
const BEST_FIRST: &str = "ORDER BY priority DESC, created_at ASC, rowid ASC";

/// SQLite-backed [`JobStore`].
///
/// Wraps one connection in a `Mutex`. Processes (or engines) that share a
/// database file each open their own `SqliteJobStore`; SQLite's write lock
/// plus the conditional updates keep them from stepping on each other.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        Self::new(db::open(path, busy_timeout)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(db::open_in_memory()?)
    }

    /// Run a best-first scan. `where_clause` binds `now` as `?1`.
    fn select_jobs(
        &self,
        where_clause: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM jobs WHERE {where_clause} {BEST_FIRST} LIMIT ?2");
        let mut stmt = conn.prepare_cached(&sql)?;
        let jobs = stmt
            .query_map(params![fmt_ts(now), sql_limit(limit)], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type))]
    fn insert(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        let id = Uuid::now_v7().to_string();
        let payload = serde_json::to_string(&job.payload)?;
        // Timestamps are stored with microsecond precision; hand back what a
        // later read will see.
        let now = now.trunc_subsecs(6);
        let scheduled_at = job.scheduled_at.map(|at| at.trunc_subsecs(6));
        let now_str = fmt_ts(now);
        let scheduled = scheduled_at.map(fmt_ts);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs
             (id, job_type, payload, priority, status, attempts, max_attempts,
              scheduled_at, error_message, started_at, completed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6, NULL, NULL, NULL, ?7, ?7)",
            params![
                id,
                job.job_type,
                payload,
                job.priority.value(),
                job.max_attempts,
                scheduled,
                now_str
            ],
        )?;

        Ok(Job {
            id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            scheduled_at,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn find_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.select_jobs(
            "status = 'pending' AND attempts = 0
             AND (scheduled_at IS NULL OR scheduled_at <= ?1)",
            now,
            limit,
        )
    }

    fn find_retryable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.select_jobs(
            "status = 'pending' AND attempts > 0 AND attempts < max_attempts
             AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
            now,
            limit,
        )
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        self.select_jobs(
            "status = 'pending' AND attempts < max_attempts
             AND (scheduled_at IS NULL OR scheduled_at <= ?1)",
            now,
            limit,
        )
    }

    #[instrument(skip(self))]
    fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        // The WHERE clause re-checks everything the scan checked: the row may
        // have been claimed, cancelled or rescheduled since it was read.
        let claimed = conn
            .query_row(
                &format!(
                    "UPDATE jobs
                     SET status = 'processing', started_at = ?2, attempts = attempts + 1,
                         updated_at = ?2
                     WHERE id = ?1 AND status = 'pending' AND attempts < max_attempts
                       AND (scheduled_at IS NULL OR scheduled_at <= ?2)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![id, fmt_ts(now)],
                row_to_job,
            )
            .optional()?;
        if claimed.is_none() {
            debug!("claim lost");
        }
        Ok(claimed)
    }

    fn mark_completed(&self, id: &str, attempt: u32, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'completed', completed_at = ?2, error_message = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'processing' AND attempts = ?3",
            params![id, fmt_ts(now), attempt],
        )?;
        Ok(n == 1)
    }

    fn mark_retrying(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'pending', scheduled_at = ?2, error_message = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'processing' AND attempts = ?5
               AND attempts < max_attempts",
            params![id, fmt_ts(retry_at), error, fmt_ts(now), attempt],
        )?;
        Ok(n == 1)
    }

    fn mark_failed(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'processing' AND attempts = ?4",
            params![id, error, fmt_ts(now), attempt],
        )?;
        Ok(n == 1)
    }

    #[instrument(skip(self))]
    fn remove(&self, id: &str) -> Result<Removal> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND status != 'processing'",
            [id],
        )?;
        if n == 1 {
            return Ok(Removal::Deleted);
        }
        let exists = conn
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [id], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(if exists {
            Removal::Processing
        } else {
            Removal::NotFound
        })
    }

    fn reset_failed(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE jobs
             SET status = 'pending', attempts = 0, scheduled_at = NULL, error_message = NULL,
                 started_at = NULL, completed_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, fmt_ts(now)],
        )?;
        Ok(n == 1)
    }

    #[instrument(skip(self))]
    fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            [fmt_ts(cutoff)],
        )?;
        Ok(n)
    }

    #[instrument(skip(self, error))]
    fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery> {
        let cutoff_str = fmt_ts(cutoff);
        let now_str = fmt_ts(now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let failed = tx.execute(
            "UPDATE jobs
             SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE status = 'processing' AND started_at < ?1 AND attempts >= max_attempts",
            params![cutoff_str, error, now_str],
        )?;
        let requeued = tx.execute(
            "UPDATE jobs
             SET status = 'pending', scheduled_at = ?3, error_message = ?2, updated_at = ?3
             WHERE status = 'processing' AND started_at < ?1 AND attempts < max_attempts",
            params![cutoff_str, error, now_str],
        )?;
        tx.commit()?;
        Ok(StaleRecovery { requeued, failed })
    }

    fn stats(&self) -> Result<JobStats> {
        let conn = self.conn.lock().unwrap();
        let mut stats = JobStats::default();
        for status in JobStatus::ALL {
            stats.by_status.insert(status, 0);
        }

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let status: JobStatus = status
                .parse()
                .map_err(|_| QueueError::Corrupt(format!("unknown status {status:?}")))?;
            stats.by_status.insert(status, count as u64);
            stats.total += count as u64;
        }

        let mut stmt = conn.prepare("SELECT job_type, COUNT(*) FROM jobs GROUP BY job_type")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (job_type, count) = row?;
            stats.by_type.insert(job_type, count as u64);
        }
        Ok(stats)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.job_type,
                    sql_limit(filter.limit),
                    sql_limit(filter.offset)
                ],
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn job_types(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT job_type FROM jobs ORDER BY job_type")?;
        let types = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }
}

/// SQLite reads a negative LIMIT as "no limit"; saturate instead of wrapping.
fn sql_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Map a SQLite row (selected with [`JOB_COLUMNS`]) to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(2)?;
    let priority: i64 = row.get(3)?;
    let status: String = row.get(4)?;

    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(2, e))?,
        priority: u8::try_from(priority)
            .map_err(|e| conversion_err(3, e))
            .and_then(|p| Priority::new(p).map_err(|e| conversion_err(3, e)))?,
        status: status.parse().map_err(|e| conversion_err(4, e))?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        scheduled_at: parse_opt_ts(row.get(7)?).map_err(|e| conversion_err(7, e))?,
        error_message: row.get(8)?,
        started_at: parse_opt_ts(row.get(9)?).map_err(|e| conversion_err(9, e))?,
        completed_at: parse_opt_ts(row.get(10)?).map_err(|e| conversion_err(10, e))?,
        created_at: parse_ts(&row.get::<_, String>(11)?).map_err(|e| conversion_err(11, e))?,
        updated_at: parse_ts(&row.get::<_, String>(12)?).map_err(|e| conversion_err(12, e))?,
    })
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
