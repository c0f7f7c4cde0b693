//! History store.
//!
//! Append-only log of probe outcomes, queryable by last record per target and
//! by time range. [`SqliteStore`] is the durable implementation used by the
//! binary; [`MemoryStore`] keeps everything in process.

mod memory;
mod sqlite;

pub use memory::*;
pub use sqlite::*;

use crate::models::{CheckResult, HistoryRecord, TargetId};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// History store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Persistence capability consumed by the pipeline.
pub trait HistoryStore: Send + Sync {
    /// Persist `result` and return the stored record.
    ///
    /// A result timestamped before the target's last record is stored with
    /// the last record's timestamp so per-target order never goes backwards.
    fn append(&self, result: &CheckResult) -> Result<HistoryRecord, StoreError>;

    /// Most recently appended record for `target_id`.
    fn get_last(&self, target_id: &TargetId) -> Result<Option<HistoryRecord>, StoreError>;

    /// All records with `start <= time <= end`, oldest first.
    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError>;
}

/// Timestamp to store for `result` given the target's previous record.
fn ordered_time(result: &CheckResult, last: Option<&HistoryRecord>) -> DateTime<Utc> {
    match last {
        Some(prev) if prev.time > result.time => {
            tracing::warn!(
                "History: {} result at {} predates last record at {}, clamping",
                result.target_id,
                result.time,
                prev.time
            );
            prev.time
        }
        _ => result.time,
    }
}
