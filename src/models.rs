//! Plain data types shared by every stage of the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a monitored endpoint, derived from its address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of probing one target once.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub target_id: TargetId,
    /// Time the probe started.
    pub time: DateTime<Utc>,
    pub outcome: Outcome,
    /// Status code, latency or error text.
    pub detail: String,
    pub latency: Option<Duration>,
}

impl CheckResult {
    pub fn success(
        target_id: TargetId,
        time: DateTime<Utc>,
        detail: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            target_id,
            time,
            outcome: Outcome::Success,
            detail: detail.into(),
            latency: Some(latency),
        }
    }

    pub fn failure(target_id: TargetId, time: DateTime<Utc>, detail: impl Into<String>) -> Self {
        Self {
            target_id,
            time,
            outcome: Outcome::Failure,
            detail: detail.into(),
            latency: None,
        }
    }
}

/// A persisted [`CheckResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    /// Store-assigned, increasing in append order.
    pub id: i64,
    pub target_id: TargetId,
    pub time: DateTime<Utc>,
    pub outcome: Outcome,
    pub detail: String,
    /// Latency in milliseconds, when the probe got far enough to measure it.
    pub latency_ms: Option<f64>,
}

impl HistoryRecord {
    pub fn from_result(id: i64, result: &CheckResult) -> Self {
        Self {
            id,
            target_id: result.target_id.clone(),
            time: result.time,
            outcome: result.outcome,
            detail: result.detail.clone(),
            latency_ms: result.latency.map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}
