use super::*;
use crate::history::MemoryStore;
use crate::models::{HistoryRecord, Outcome};
use crate::notify::testing::RecordingNotifier;
use crate::probe::Checker;
use crate::registry::{RegistryDefaults, Target, TargetSpec};

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec(name: &str, address: &str, timeout_secs: f64) -> TargetSpec {
    TargetSpec {
        name: Some(name.to_string()),
        address: Some(address.to_string()),
        timeout_secs: Some(timeout_secs),
        ..Default::default()
    }
}

fn settings() -> RunSettings {
    RunSettings {
        run_margin: Duration::from_millis(200),
        retry: RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        messages: MessageSettings {
            recipients: vec!["ops@example.com".to_string()],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn monitor(
    settings: RunSettings,
    store: Arc<dyn HistoryStore>,
    probe: Arc<dyn Probe>,
    notifier: Arc<RecordingNotifier>,
) -> Monitor {
    Monitor::new(settings, store, probe, notifier)
}

/// Probe whose outcome is decided by a closure.
struct FnProbe<F>(F);

#[async_trait]
impl<F> Probe for FnProbe<F>
where
    F: Fn(&Target) -> CheckResult + Send + Sync,
{
    async fn probe(&self, target: &Target) -> CheckResult {
        (self.0)(target)
    }
}

/// Never answers for targets named "hang".
struct HangingProbe;

#[async_trait]
impl Probe for HangingProbe {
    async fn probe(&self, target: &Target) -> CheckResult {
        if target.name == "hang" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        CheckResult::success(target.id.clone(), Utc::now(), "ok", Duration::from_millis(1))
    }
}

/// Panics for targets named "boom".
struct PanickingProbe;

#[async_trait]
impl Probe for PanickingProbe {
    async fn probe(&self, target: &Target) -> CheckResult {
        if target.name == "boom" {
            panic!("checker bug");
        }
        CheckResult::success(target.id.clone(), Utc::now(), "ok", Duration::from_millis(1))
    }
}

/// Records the highest number of probes in flight at once.
#[derive(Default)]
struct CountingProbe {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Probe for CountingProbe {
    async fn probe(&self, target: &Target) -> CheckResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        CheckResult::success(target.id.clone(), Utc::now(), "ok", Duration::from_millis(20))
    }
}

/// Store whose writes always fail.
struct ReadOnlyStore;

impl HistoryStore for ReadOnlyStore {
    fn append(&self, _: &CheckResult) -> Result<HistoryRecord, StoreError> {
        Err(StoreError::Migration("database is read-only".to_string()))
    }

    fn get_last(&self, _: &TargetId) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(None)
    }

    fn query_range(
        &self,
        _: DateTime<Utc>,
        _: DateTime<Utc>,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_regular_then_resume_with_http_targets() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let specs = [
        TargetSpec {
            accepted_statuses: Some(vec![crate::registry::StatusSpec::Code(200)]),
            ..spec("A", &format!("{}/a", server.uri()), 2.0)
        },
        spec("B", &format!("{}/b", server.uri()), 0.3),
    ];
    let (registry, rejected) = Registry::build(&specs, &RegistryDefaults::default());

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let monitor = monitor(
        settings(),
        store.clone(),
        Arc::new(Checker::new().unwrap()),
        notifier.clone(),
    );

    let report = monitor.run_regular(&registry, rejected).await.unwrap();
    let outcomes: Vec<_> = report.evaluations.iter().map(|e| e.result.outcome).collect();
    assert_eq!(outcomes, vec![Outcome::Success, Outcome::Failure]);
    assert_eq!(report.delivery, Delivery::Sent { attempts: 1 });
    assert_eq!(store.all().unwrap().len(), 2);

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[URGENT] Service failed for B");
    assert!(sent[0].body.contains("timed out"));
    assert!(!sent[0].body.contains("  A ("));

    let later = Utc::now() + chrono::Duration::hours(1);
    let resume = monitor.run_resume(&registry, later).await.unwrap();
    assert_eq!(resume.digest.targets.len(), 1);
    let b = &resume.digest.targets[0];
    assert_eq!(b.label, "B");
    assert_eq!(b.count, 1);
    assert_eq!(resume.digest.total_runs, 2);
    assert_eq!(notifier.sent().len(), 2);
}

#[tokio::test]
async fn test_unreachable_tcp_target_over_three_hourly_runs() {
    let (registry, _) = Registry::build(
        &[spec("mail", "mail.example.com:25", 1.0)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let now = Utc::now();
    let runs = [
        now - chrono::Duration::hours(3),
        now - chrono::Duration::hours(2),
        now - chrono::Duration::hours(1),
    ];

    for (i, time) in runs.into_iter().enumerate() {
        let probe = FnProbe(move |t: &Target| CheckResult::failure(t.id.clone(), time, "connection refused"));
        let m = monitor(settings(), store.clone(), Arc::new(probe), notifier.clone());
        let report = m.run_regular(&registry, Vec::new()).await.unwrap();

        let expected = if i == 0 { Change::FirstSeen } else { Change::Unchanged };
        assert_eq!(report.evaluations[0].change, expected);
        assert!(report.message.is_some(), "every failing run notifies");
    }

    let records = store.all().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.outcome == Outcome::Failure));

    let m = monitor(settings(), store.clone(), Arc::new(HangingProbe), notifier.clone());
    let resume = m.run_resume(&registry, now).await.unwrap();
    let mail = &resume.digest.targets[0];
    assert_eq!(mail.count, 3);
    assert_eq!(mail.first_failure, runs[0]);
    assert_eq!(mail.last_failure, runs[2]);
    assert!(resume.message.body.contains("  mail: 3 / 3\n"));
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let (registry, _) = Registry::build(
        &[spec("mail", "mail.example.com:25", 1.0)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .append(&CheckResult::failure(
            TargetId::new("mail.example.com:25"),
            now - chrono::Duration::minutes(30),
            "connection refused",
        ))
        .unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let m = monitor(settings(), store.clone(), Arc::new(HangingProbe), notifier.clone());
    let first = m.run_resume(&registry, now).await.unwrap();
    let second = m.run_resume(&registry, now).await.unwrap();

    assert_eq!(first.message.body.as_bytes(), second.message.body.as_bytes());
    assert_eq!(first.digest, second.digest);
    assert_eq!(store.all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_target_does_not_block_others() {
    let specs = [
        spec("good", "good.example.com:80", 1.0),
        TargetSpec {
            name: Some("broken".to_string()),
            ..Default::default()
        },
        spec("bad-port", "db.example.com:99999", 1.0),
    ];
    let (registry, rejected) = Registry::build(&specs, &RegistryDefaults::default());
    assert_eq!(rejected.len(), 2);

    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let probe = FnProbe(|t: &Target| CheckResult::failure(t.id.clone(), Utc::now(), "connection refused"));
    let m = monitor(settings(), store.clone(), Arc::new(probe), notifier.clone());

    let report = m.run_regular(&registry, rejected).await.unwrap();
    assert_eq!(report.evaluations.len(), 1);
    assert_eq!(report.rejected.len(), 2);
    assert_eq!(store.all().unwrap().len(), 1);

    let body = &notifier.sent()[0].body;
    assert!(body.contains("Configuration problems:\n  target #2 (broken): missing address\n"));
    assert!(body.contains("target #3 (bad-port)"));
}

#[tokio::test]
async fn test_no_targets_is_an_error() {
    let m = monitor(
        settings(),
        Arc::new(MemoryStore::new()),
        Arc::new(HangingProbe),
        Arc::new(RecordingNotifier::default()),
    );
    let err = m.run_regular(&Registry::default(), Vec::new()).await.unwrap_err();
    assert!(matches!(err, RunError::NoTargets));
}

#[tokio::test]
async fn test_deadline_records_hung_probes_as_failures() {
    let (registry, _) = Registry::build(
        &[spec("hang", "slow.example.com:1", 0.1), spec("fast", "fast.example.com:1", 0.1)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let m = monitor(settings(), store.clone(), Arc::new(HangingProbe), notifier.clone());

    let started = std::time::Instant::now();
    let report = m.run_regular(&registry, Vec::new()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let hung = &report.evaluations[0];
    assert_eq!(hung.result.outcome, Outcome::Failure);
    assert_eq!(hung.result.detail, UNFINISHED_DETAIL);
    assert_eq!(report.evaluations[1].result.outcome, Outcome::Success);
    assert_eq!(store.all().unwrap().len(), 2);
    assert_eq!(notifier.sent()[0].subject, "[URGENT] Service failed for hang");
}

#[tokio::test]
async fn test_panicked_check_is_recorded_with_its_cause() {
    let (registry, _) = Registry::build(
        &[spec("boom", "boom.example.com:1", 1.0), spec("fine", "fine.example.com:1", 1.0)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let m = monitor(
        settings(),
        store.clone(),
        Arc::new(PanickingProbe),
        Arc::new(RecordingNotifier::default()),
    );

    let report = m.run_regular(&registry, Vec::new()).await.unwrap();
    let failed = &report.evaluations[0].result;
    assert_eq!(failed.outcome, Outcome::Failure);
    assert_ne!(failed.detail, UNFINISHED_DETAIL);
    assert!(failed.detail.starts_with("check aborted:"), "{}", failed.detail);
    assert!(failed.detail.contains("panicked"), "{}", failed.detail);
    assert_eq!(report.evaluations[1].result.outcome, Outcome::Success);
    assert_eq!(store.all().unwrap().len(), 2);
}

#[tokio::test]
async fn test_oversized_budget_saturates_instead_of_overflowing() {
    let specs: Vec<_> = (1..=3)
        .map(|i| spec(&format!("t{}", i), &format!("host{}.example.com:80", i), 86_400.0))
        .collect();
    let (registry, rejected) = Registry::build(&specs, &RegistryDefaults::default());
    assert!(rejected.is_empty());

    let m = monitor(
        RunSettings {
            max_concurrency: 1,
            run_margin: Duration::MAX,
            ..settings()
        },
        Arc::new(MemoryStore::new()),
        Arc::new(HangingProbe),
        Arc::new(RecordingNotifier::default()),
    );
    assert_eq!(m.run_budget(&registry), Duration::MAX);

    let report = m.run_regular(&registry, Vec::new()).await.unwrap();
    assert_eq!(report.evaluations.len(), 3);
    assert!(report.evaluations.iter().all(|e| !e.is_failing()));
}

#[tokio::test]
async fn test_worker_limit_is_respected() {
    let specs: Vec<_> = (1..=6)
        .map(|i| spec(&format!("t{}", i), &format!("host{}.example.com:80", i), 1.0))
        .collect();
    let (registry, _) = Registry::build(&specs, &RegistryDefaults::default());

    let probe = Arc::new(CountingProbe::default());
    let m = monitor(
        RunSettings {
            max_concurrency: 2,
            ..settings()
        },
        Arc::new(MemoryStore::new()),
        probe.clone(),
        Arc::new(RecordingNotifier::default()),
    );

    let report = m.run_regular(&registry, Vec::new()).await.unwrap();
    assert_eq!(report.evaluations.len(), 6);
    assert_eq!(report.delivery, Delivery::NotNeeded);
    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_failed_delivery_keeps_history_and_completes() {
    let (registry, _) = Registry::build(
        &[spec("mail", "mail.example.com:25", 1.0)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::failing(100));
    let probe = FnProbe(|t: &Target| CheckResult::failure(t.id.clone(), Utc::now(), "connection refused"));
    let m = monitor(settings(), store.clone(), Arc::new(probe), notifier.clone());

    let report = m.run_regular(&registry, Vec::new()).await.unwrap();
    assert!(matches!(report.delivery, Delivery::Failed { .. }));
    assert_eq!(notifier.attempts(), 3);
    assert_eq!(store.all().unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_write_failure_aborts_run() {
    let (registry, _) = Registry::build(
        &[spec("mail", "mail.example.com:25", 1.0)],
        &RegistryDefaults::default(),
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let probe = FnProbe(|t: &Target| CheckResult::failure(t.id.clone(), Utc::now(), "connection refused"));
    let m = monitor(settings(), Arc::new(ReadOnlyStore), Arc::new(probe), notifier.clone());

    let err = m.run_regular(&registry, Vec::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Store(_)));
    assert_eq!(notifier.attempts(), 0);
}

#[tokio::test]
async fn test_transitions_policy_suppresses_ongoing_outage() {
    let (registry, _) = Registry::build(
        &[spec("mail", "mail.example.com:25", 1.0)],
        &RegistryDefaults::default(),
    );
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let policy = RunSettings {
        policy: NotifyPolicy::Transitions,
        ..settings()
    };

    for _ in 0..2 {
        let probe = FnProbe(|t: &Target| CheckResult::failure(t.id.clone(), Utc::now(), "connection refused"));
        let m = monitor(policy.clone(), store.clone(), Arc::new(probe), notifier.clone());
        m.run_regular(&registry, Vec::new()).await.unwrap();
    }

    assert_eq!(notifier.sent().len(), 1);
    assert_eq!(store.all().unwrap().len(), 2);
}

#[tokio::test]
async fn test_all_clear_digest_can_be_suppressed() {
    let registry = Registry::default();
    let store = Arc::new(MemoryStore::new());

    let notifier = Arc::new(RecordingNotifier::default());
    let m = monitor(settings(), store.clone(), Arc::new(HangingProbe), notifier.clone());
    let sent = m.run_resume(&registry, Utc::now()).await.unwrap();
    assert_eq!(sent.delivery, Delivery::Sent { attempts: 1 });
    assert!(notifier.sent()[0].body.contains("No failures recorded"));

    let quiet = RunSettings {
        send_all_clear_digest: false,
        ..settings()
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let m = monitor(quiet, store, Arc::new(HangingProbe), notifier.clone());
    let report = m.run_resume(&registry, Utc::now()).await.unwrap();
    assert_eq!(report.delivery, Delivery::NotNeeded);
    assert!(notifier.sent().is_empty());
}
