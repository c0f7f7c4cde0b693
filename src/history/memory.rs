//! In-process history store.

use super::{ordered_time, HistoryStore, StoreError};
use crate::models::{CheckResult, HistoryRecord, TargetId};

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

/// Keeps records in a vector in append order. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Vec<HistoryRecord>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Snapshot of every record, in append order.
    pub fn all(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(self.records()?.clone())
    }
}

impl HistoryStore for MemoryStore {
    fn append(&self, result: &CheckResult) -> Result<HistoryRecord, StoreError> {
        let mut records = self.records()?;

        let last = records.iter().rev().find(|r| r.target_id == result.target_id);
        let time = ordered_time(result, last);

        let mut record = HistoryRecord::from_result(records.len() as i64 + 1, result);
        record.time = time;
        records.push(record.clone());
        Ok(record)
    }

    fn get_last(&self, target_id: &TargetId) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self
            .records()?
            .iter()
            .rev()
            .find(|r| &r.target_id == target_id)
            .cloned())
    }

    fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let mut matching: Vec<_> = self
            .records()?
            .iter()
            .filter(|r| r.time >= start && r.time <= end)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        Ok(matching)
    }
}
