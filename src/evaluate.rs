//! State evaluation: compares a fresh result with the target's last record.

use crate::models::{CheckResult, HistoryRecord, Outcome};

use serde::{Deserialize, Serialize};

/// How a result relates to the previous record for the same target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// No previous record.
    FirstSeen,
    Unchanged,
    WentDown,
    Recovered,
}

/// A check result together with the state it was compared against.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub result: CheckResult,
    pub previous: Option<HistoryRecord>,
    pub change: Change,
}

impl Evaluation {
    pub fn is_transition(&self) -> bool {
        self.change != Change::Unchanged
    }

    pub fn is_failing(&self) -> bool {
        self.result.outcome.is_failure()
    }

    /// A failure that was not already failing at the last run.
    pub fn is_new_failure(&self) -> bool {
        self.is_failing() && self.is_transition()
    }

    pub fn is_recovery(&self) -> bool {
        self.change == Change::Recovered
    }
}

/// Classify `result` against `previous`.
pub fn evaluate(previous: Option<HistoryRecord>, result: CheckResult) -> Evaluation {
    let change = match (&previous, result.outcome) {
        (None, _) => Change::FirstSeen,
        (Some(prev), now) if prev.outcome == now => Change::Unchanged,
        (Some(_), Outcome::Failure) => Change::WentDown,
        (Some(_), Outcome::Success) => Change::Recovered,
    };

    Evaluation {
        result,
        previous,
        change,
    }
}

/// When a regular run sends its batched message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// Whenever any target is failing.
    #[default]
    EveryFailure,
    /// Only when at least one target newly failed.
    Transitions,
}

impl NotifyPolicy {
    pub fn should_notify(&self, evaluations: &[Evaluation]) -> bool {
        match self {
            NotifyPolicy::EveryFailure => evaluations.iter().any(Evaluation::is_failing),
            NotifyPolicy::Transitions => evaluations.iter().any(Evaluation::is_new_failure),
        }
    }
}
