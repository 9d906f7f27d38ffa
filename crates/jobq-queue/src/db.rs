use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{QueueError, Result};

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` table (idempotent) plus the indexes the ready-scan and
/// the operator listing rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id             TEXT    NOT NULL PRIMARY KEY,
            job_type       TEXT    NOT NULL,
            payload        TEXT    NOT NULL,   -- opaque JSON
            priority       INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 15),
            status         TEXT    NOT NULL DEFAULT 'pending',
            attempts       INTEGER NOT NULL DEFAULT 0,
            max_attempts   INTEGER NOT NULL CHECK (max_attempts BETWEEN 1 AND 10),
            scheduled_at   TEXT,               -- RFC 3339 or NULL
            error_message  TEXT,
            started_at     TEXT,
            completed_at   TEXT,
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        );

        -- Ready/retry scans: WHERE status = 'pending' ORDER BY priority DESC, created_at
        CREATE INDEX IF NOT EXISTS idx_jobs_ready
            ON jobs (status, priority DESC, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_type ON jobs (job_type);
        ",
    )?;
    Ok(())
}

/// Open (creating if needed) the database at `path` and apply the pragmas
/// every queue connection needs.
///
/// WAL lets readers proceed while a writer commits; the busy timeout makes
/// competing writers from other connections wait instead of failing.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn, busy_timeout)?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // journal_mode returns a row, so it cannot go through execute().
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
    Ok(())
}

/// Fixed-width RFC 3339 (microseconds, `Z`) so string order is time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(fmt_ts(a).len(), fmt_ts(b).len());
    }

    #[test]
    fn timestamp_roundtrip_keeps_micros() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(parse_ts(&fmt_ts(ts)).unwrap(), ts);
    }

    #[test]
    fn priority_check_constraint() {
        let conn = open_in_memory().unwrap();
        let err = conn.execute(
            "INSERT INTO jobs (id, job_type, payload, priority, max_attempts, created_at, updated_at)
             VALUES ('x', 't', '{}', 16, 3, 'now', 'now')",
            [],
        );
        assert!(err.is_err());
    }
}
