//! Builds the text of the per-run alert and of the daily digest.

use crate::digest::DigestReport;
use crate::evaluate::Evaluation;
use crate::notify::Message;
use crate::registry::{Registry, Rejected};

use chrono::{DateTime, Utc};
use std::fmt::Write as _;

pub const DIGEST_SUBJECT: &str = "Monitoring Daily Resume";

/// Addressing shared by every message of a run.
#[derive(Debug, Clone)]
pub struct MessageSettings {
    pub recipients: Vec<String>,
    pub subject_prefix: String,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            subject_prefix: "[URGENT]".to_string(),
        }
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Alert listing every failing target of a regular run.
pub fn regular_message(
    evaluations: &[Evaluation],
    rejected: &[Rejected],
    registry: &Registry,
    now: DateTime<Utc>,
    settings: &MessageSettings,
) -> Message {
    let failing: Vec<_> = evaluations.iter().filter(|e| e.is_failing()).collect();
    let recovered: Vec<_> = evaluations.iter().filter(|e| e.is_recovery()).collect();

    let subject = match failing.as_slice() {
        [only] => format!(
            "{} Service failed for {}",
            settings.subject_prefix,
            registry.label(&only.result.target_id)
        ),
        many => format!("{} {} services failing", settings.subject_prefix, many.len()),
    };

    let mut body = String::new();
    let _ = writeln!(body, "The following services are failing as of {}:", format_time(&now));

    for eval in &failing {
        let id = &eval.result.target_id;
        let address = registry.get(id).map(|t| t.address.as_str()).unwrap_or(id.as_str());
        let _ = writeln!(body);
        let _ = writeln!(body, "  {} ({})", registry.label(id), address);
        match &eval.previous {
            Some(prev) if !eval.is_transition() => {
                let _ = writeln!(
                    body,
                    "    status: still failing, last failure recorded {}",
                    format_time(&prev.time)
                );
            }
            _ => {
                let _ = writeln!(body, "    status: new failure");
            }
        }
        let _ = writeln!(body, "    detail: {}", eval.result.detail);
    }

    if !recovered.is_empty() {
        let _ = writeln!(body);
        let _ = writeln!(body, "Recovered:");
        for eval in &recovered {
            let _ = writeln!(body, "  {}", registry.label(&eval.result.target_id));
        }
    }

    if !rejected.is_empty() {
        let _ = writeln!(body);
        let _ = writeln!(body, "Configuration problems:");
        for r in rejected {
            let _ = writeln!(body, "  {}", r);
        }
    }

    Message {
        subject,
        body,
        recipients: settings.recipients.clone(),
    }
}

/// Summary of the digest window. Deterministic for a given report.
pub fn digest_message(report: &DigestReport, settings: &MessageSettings) -> Message {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "Here is your summary from {} until {}:",
        format_time(&report.window_start),
        format_time(&report.window_end)
    );
    let _ = writeln!(body);
    let _ = writeln!(body, "Total runs: {}", report.total_runs);
    let _ = writeln!(body, "Total errors: {}", report.total_failures);
    let _ = writeln!(body);

    if report.is_all_clear() {
        let _ = writeln!(body, "No failures recorded in this window.");
    } else {
        let _ = writeln!(body, "Per target (target: errors / runs):");
        for target in &report.targets {
            let _ = writeln!(body, "  {}: {} / {}", target.label, target.count, target.runs);
            let _ = writeln!(body, "    first failure: {}", format_time(&target.first_failure));
            let _ = writeln!(body, "    last failure: {}", format_time(&target.last_failure));
            if let Some(last) = target.failures.last() {
                let _ = writeln!(body, "    last error: {}", last.detail);
            }
        }
    }

    let _ = writeln!(body);
    let _ = writeln!(body, "Have a great day!");

    Message {
        subject: DIGEST_SUBJECT.to_string(),
        body,
        recipients: settings.recipients.clone(),
    }
}
