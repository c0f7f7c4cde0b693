//! Run pipeline: probes targets, records outcomes and sends the batched
//! notification (regular mode), or builds and sends the digest (resume mode).

use crate::compose::{self, MessageSettings};
use crate::digest::{build_digest, DigestReport};
use crate::evaluate::{evaluate, Change, Evaluation, NotifyPolicy};
use crate::history::{HistoryStore, StoreError};
use crate::models::{CheckResult, TargetId};
use crate::notify::{send_with_retry, Message, Notifier, RetryPolicy};
use crate::probe::Probe;
use crate::registry::{Registry, Rejected};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run error types. Both abort the run with a nonzero exit.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("history store error: {0}")]
    Store(#[from] StoreError),
    #[error("no valid targets to probe")]
    NoTargets,
}

/// Knobs for one invocation, built from the configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_concurrency: usize,
    pub run_margin: Duration,
    pub policy: NotifyPolicy,
    pub send_all_clear_digest: bool,
    pub digest_window: chrono::Duration,
    pub retry: RetryPolicy,
    pub messages: MessageSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            run_margin: Duration::from_secs(5),
            policy: NotifyPolicy::default(),
            send_all_clear_digest: true,
            digest_window: chrono::Duration::hours(24),
            retry: RetryPolicy::default(),
            messages: MessageSettings::default(),
        }
    }
}

/// What happened to the run's message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    NotNeeded,
    Sent { attempts: u32 },
    Failed { error: String },
}

/// Result of a regular run.
#[derive(Debug, Clone)]
pub struct RegularReport {
    /// One per target, in registry order.
    pub evaluations: Vec<Evaluation>,
    pub rejected: Vec<Rejected>,
    pub message: Option<Message>,
    pub delivery: Delivery,
}

impl RegularReport {
    pub fn failing(&self) -> impl Iterator<Item = &Evaluation> {
        self.evaluations.iter().filter(|e| e.is_failing())
    }
}

/// Result of a resume run.
#[derive(Debug, Clone)]
pub struct ResumeReport {
    pub digest: DigestReport,
    pub message: Message,
    pub delivery: Delivery,
}

/// Detail recorded for targets whose probe never reported back.
pub const UNFINISHED_DETAIL: &str = "probe did not finish before the run deadline";

/// Deadline used when the run budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// The monitoring pipeline with its collaborators.
pub struct Monitor {
    settings: RunSettings,
    store: Arc<dyn HistoryStore>,
    probe: Arc<dyn Probe>,
    notifier: Arc<dyn Notifier>,
}

impl Monitor {
    pub fn new(
        settings: RunSettings,
        store: Arc<dyn HistoryStore>,
        probe: Arc<dyn Probe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            settings,
            store,
            probe,
            notifier,
        }
    }

    /// Probe every target, record the outcomes and notify about failures.
    pub async fn run_regular(
        &self,
        registry: &Registry,
        rejected: Vec<Rejected>,
    ) -> Result<RegularReport, RunError> {
        if registry.is_empty() {
            return Err(RunError::NoTargets);
        }

        tracing::info!(
            "Starting regular run with {} targets ({} rejected)",
            registry.len(),
            rejected.len()
        );

        // Last states are read once, before any probe of this run is recorded.
        let mut previous = HashMap::with_capacity(registry.len());
        for target in registry.iter() {
            previous.insert(target.id.clone(), self.store.get_last(&target.id)?);
        }

        let results = self.probe_and_record(registry).await?;

        let evaluations: Vec<_> = results
            .into_iter()
            .map(|result| {
                let last = previous.remove(&result.target_id).flatten();
                let eval = evaluate(last, result);
                log_change(registry, &eval);
                eval
            })
            .collect();

        let (message, delivery) = if self.settings.policy.should_notify(&evaluations) {
            let message = compose::regular_message(
                &evaluations,
                &rejected,
                registry,
                Utc::now(),
                &self.settings.messages,
            );
            let delivery = self.deliver(&message).await;
            (Some(message), delivery)
        } else {
            (None, Delivery::NotNeeded)
        };

        let report = RegularReport {
            evaluations,
            rejected,
            message,
            delivery,
        };
        tracing::info!(
            "Regular run finished: {} targets, {} failing, notification {:?}",
            report.evaluations.len(),
            report.failing().count(),
            report.delivery
        );
        Ok(report)
    }

    /// Build the digest for the window ending at `now` and send it.
    pub async fn run_resume(
        &self,
        registry: &Registry,
        now: DateTime<Utc>,
    ) -> Result<ResumeReport, RunError> {
        let digest = build_digest(
            self.store.as_ref(),
            registry,
            now,
            self.settings.digest_window,
        )?;
        let message = compose::digest_message(&digest, &self.settings.messages);

        let delivery = if digest.is_all_clear() && !self.settings.send_all_clear_digest {
            tracing::info!("Digest is all clear, not sending");
            Delivery::NotNeeded
        } else {
            self.deliver(&message).await
        };

        Ok(ResumeReport {
            digest,
            message,
            delivery,
        })
    }

    /// Probe all targets concurrently and append each result as it arrives.
    ///
    /// Returns one result per target in registry order. Targets that did not
    /// report back before the run deadline are recorded as failures.
    async fn probe_and_record(&self, registry: &Registry) -> Result<Vec<CheckResult>, RunError> {
        let run_start = Utc::now();
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.run_budget(registry))
            .unwrap_or_else(|| now + FAR_FUTURE);

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut task_index = HashMap::with_capacity(registry.len());

        for (index, target) in registry.iter().enumerate() {
            let probe = self.probe.clone();
            let semaphore = semaphore.clone();
            let target = target.clone();

            let handle = tasks.spawn(async move {
                // Hold permit until done
                let _permit = semaphore.acquire_owned().await;
                probe.probe(&target).await
            });
            task_index.insert(handle.id(), index);
        }

        let targets: Vec<_> = registry.iter().collect();
        let mut results: Vec<Option<CheckResult>> = vec![None; registry.len()];
        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => {
                    let (id, result) = match joined {
                        Some(Ok((id, result))) => (id, result),
                        Some(Err(e)) => {
                            tracing::error!("Probe task failed: {}", e);
                            let Some(&index) = task_index.get(&e.id()) else { continue };
                            let detail = format!("check aborted: {}", e);
                            (e.id(), CheckResult::failure(targets[index].id.clone(), run_start, detail))
                        }
                        None => break,
                    };
                    if let Some(&index) = task_index.get(&id) {
                        self.store.append(&result)?;
                        results[index] = Some(result);
                    }
                },
                _ = &mut expired => {
                    tracing::warn!("Run deadline reached with {} probes outstanding", tasks.len());
                    tasks.abort_all();
                    break;
                }
            }
        }

        let mut complete = Vec::with_capacity(results.len());
        for (slot, target) in results.into_iter().zip(registry.iter()) {
            let result = match slot {
                Some(r) => r,
                None => {
                    let r = CheckResult::failure(target.id.clone(), run_start, UNFINISHED_DETAIL);
                    self.store.append(&r)?;
                    r
                }
            };
            complete.push(result);
        }

        Ok(complete)
    }

    /// Time allowed for the probe phase: the longest target timeout for each
    /// wave of `max_concurrency` probes, plus the configured margin.
    fn run_budget(&self, registry: &Registry) -> Duration {
        let concurrency = self.settings.max_concurrency.max(1);
        let waves = u32::try_from(registry.len().div_ceil(concurrency).max(1)).unwrap_or(u32::MAX);
        registry
            .max_timeout()
            .saturating_mul(waves)
            .saturating_add(self.settings.run_margin)
    }

    async fn deliver(&self, message: &Message) -> Delivery {
        match send_with_retry(self.notifier.as_ref(), message, &self.settings.retry).await {
            Ok(attempts) => Delivery::Sent { attempts },
            Err(e) => {
                tracing::error!("Notification {:?} not delivered: {}", message.subject, e);
                Delivery::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

fn log_change(registry: &Registry, eval: &Evaluation) {
    let id: &TargetId = &eval.result.target_id;
    let label = registry.label(id);
    match eval.change {
        Change::WentDown => tracing::warn!("Target {} went down: {}", label, eval.result.detail),
        Change::Recovered => tracing::info!("Target {} recovered", label),
        Change::FirstSeen => {
            tracing::info!("Target {} first probe: {}", label, eval.result.outcome)
        }
        Change::Unchanged => {
            tracing::debug!("Target {} still {}", label, eval.result.outcome)
        }
    }
}

#[cfg(test)]
mod tests;
