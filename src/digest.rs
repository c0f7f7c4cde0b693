//! Digest builder.
//!
//! Rolls up the failures recorded over a trailing window, per target.

use crate::history::{HistoryStore, StoreError};
use crate::models::{HistoryRecord, TargetId};
use crate::registry::Registry;

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Failures of a single target inside the window.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDigest {
    pub target_id: TargetId,
    pub label: String,
    /// All probes recorded for the target in the window.
    pub runs: usize,
    pub count: usize,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    /// Failure records, oldest first.
    pub failures: Vec<HistoryRecord>,
}

/// Failure summary for `[window_start, window_end]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_runs: usize,
    pub total_failures: usize,
    /// Only targets with at least one failure, ordered by target id.
    pub targets: Vec<TargetDigest>,
}

impl DigestReport {
    pub fn is_all_clear(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, id: &TargetId) -> Option<&TargetDigest> {
        self.targets.iter().find(|t| &t.target_id == id)
    }
}

/// Build the digest for the window of length `window` ending at `now`.
///
/// Both bounds are inclusive. Only reads from `store`.
pub fn build_digest(
    store: &dyn HistoryStore,
    registry: &Registry,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<DigestReport, StoreError> {
    let window_start = now - window;
    let records = store.query_range(window_start, now)?;

    let mut per_target: BTreeMap<TargetId, (usize, Vec<HistoryRecord>)> = BTreeMap::new();
    for record in records {
        let entry = per_target.entry(record.target_id.clone()).or_default();
        entry.0 += 1;
        if record.outcome.is_failure() {
            entry.1.push(record);
        }
    }

    let total_runs: usize = per_target.values().map(|(runs, _)| runs).sum();

    let targets: Vec<_> = per_target
        .into_iter()
        .filter_map(|(target_id, (runs, failures))| {
            let first_failure = failures.first()?.time;
            let last_failure = failures.last()?.time;
            Some(TargetDigest {
                label: registry.label(&target_id).to_string(),
                target_id,
                runs,
                count: failures.len(),
                first_failure,
                last_failure,
                failures,
            })
        })
        .collect();

    let total_failures: usize = targets.iter().map(|t| t.count).sum();

    tracing::info!(
        "Digest: {} runs, {} failures across {} targets between {} and {}",
        total_runs,
        total_failures,
        targets.len(),
        window_start,
        now
    );

    Ok(DigestReport {
        window_start,
        window_end: now,
        total_runs,
        total_failures,
        targets,
    })
}
