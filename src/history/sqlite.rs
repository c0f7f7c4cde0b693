//! SQLite history store implementation.

use super::{ordered_time, HistoryStore, StoreError};
use crate::models::{CheckResult, HistoryRecord, Outcome, TargetId};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Fixed-width format so that text order equals time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe, file-backed history store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// A private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/0001_history.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM history", [], |r| r.get(0))?)
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, result: &CheckResult) -> Result<HistoryRecord, StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let last = last_record(&tx, &result.target_id)?;
        let time = ordered_time(result, last.as_ref());

        let mut record = HistoryRecord::from_result(0, result);
        record.time = time;

        tx.execute(
            "INSERT INTO history (target_id, time, outcome, detail, latency_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.target_id.as_str(),
                format_db_time(&record.time),
                record.outcome.as_str(),
                record.detail,
                record.latency_ms,
            ],
        )?;
        record.id = tx.last_insert_rowid();

        tx.commit()?;
        Ok(record)
    }

    fn get_last(&self, target_id: &TargetId) -> Result<Option<HistoryRecord>, StoreError> {
        let conn = self.conn()?;
        last_record(&conn, target_id)
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_id, time, outcome, detail, latency_ms FROM history
             WHERE time >= ?1 AND time <= ?2 ORDER BY time ASC, id ASC",
        )?;

        let rows = stmt
            .query_map(
                params![format_db_time(&start), format_db_time(&end)],
                read_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter().map(into_record).collect()
    }
}

/// Raw columns of one `history` row before validation.
type RawRow = (i64, String, String, String, String, Option<f64>);

fn read_row(row: &Row<'_>) -> SqlResult<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(raw: RawRow) -> Result<HistoryRecord, StoreError> {
    let (id, target_id, time, outcome, detail, latency_ms) = raw;
    let time = parse_db_time(&time).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unparseable time {:?}", time),
    })?;
    let outcome = Outcome::parse(&outcome).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown outcome {:?}", outcome),
    })?;

    Ok(HistoryRecord {
        id,
        target_id: TargetId::new(target_id),
        time,
        outcome,
        detail,
        latency_ms,
    })
}

fn last_record(conn: &Connection, target_id: &TargetId) -> Result<Option<HistoryRecord>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT id, target_id, time, outcome, detail, latency_ms FROM history
             WHERE target_id = ?1 ORDER BY time DESC, id DESC LIMIT 1",
            params![target_id.as_str()],
            read_row,
        )
        .optional()?;

    raw.map(into_record).transpose()
}

fn format_db_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
