//! End-to-end watcher runs against fake collaborators.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use kpiwatch::config::WatchConfig;
use kpiwatch::detect::baseline::BaselineFields;
use kpiwatch::detect::Severity;
use kpiwatch::evidence::{EvidenceCollector, EvidenceError, EvidenceRequest};
use kpiwatch::guard::{Acquire, WatchLock};
use kpiwatch::notify::Notifier;
use kpiwatch::snapshot::{SnapshotError, SnapshotSource};
use kpiwatch::status::StatusPublisher;
use kpiwatch::storage::{AlertRecord, HistoryStore};
use kpiwatch::watcher::{RunOutcome, Watcher};
use kpiwatch::ExecutionMode;

struct FakeSource(Option<String>);

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch(&self) -> Result<String, SnapshotError> {
        self.0.clone().ok_or(SnapshotError::NoJson)
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    fn subjects(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, body: &str) {
        self.sent.lock().unwrap().push((subject.to_string(), body.to_string()));
    }
}

#[derive(Clone, Default)]
struct RecordingCollector {
    runs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EvidenceCollector for RecordingCollector {
    async fn collect(&self, request: &EvidenceRequest) -> Result<PathBuf, EvidenceError> {
        self.runs.lock().unwrap().push(request.run_id.clone());
        Ok(request.output_dir.join(format!("{}.json", request.run_id)))
    }
}

struct FailingCollector;

#[async_trait]
impl EvidenceCollector for FailingCollector {
    async fn collect(&self, _request: &EvidenceRequest) -> Result<PathBuf, EvidenceError> {
        Err(EvidenceError::NoPath("collector crashed".into()))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    cfg: WatchConfig,
    notifier: RecordingNotifier,
    collector: RecordingCollector,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = WatchConfig::default();
        cfg.paths.state_dir = dir.path().join("state");
        Self {
            _dir: dir,
            cfg,
            notifier: RecordingNotifier::default(),
            collector: RecordingCollector::default(),
        }
    }

    fn state_dir(&self) -> &Path {
        &self.cfg.paths.state_dir
    }

    fn watcher(&self, payload: Option<String>) -> Watcher {
        Watcher::new(
            self.cfg.clone(),
            ExecutionMode::Test,
            Box::new(FakeSource(payload)),
            Box::new(self.notifier.clone()),
            Some(Box::new(self.collector.clone())),
        )
    }

    fn history(&self) -> Vec<AlertRecord> {
        HistoryStore::new(self.cfg.paths.history_path()).load().unwrap()
    }

    fn evidence_runs(&self) -> usize {
        self.collector.runs.lock().unwrap().len()
    }
}

fn payload(total_jobs: u64, stuck: u64, timeout_rate: f64, cancel_rate: f64) -> Option<String> {
    Some(format!(
        "collecting kpis...\n{{\"total_jobs\": {}, \"stuck\": {}, \"timeout_rate\": {}, \"cancel_rate\": {}, \
         \"rows_deleted\": 0, \"total_snapshots\": 10}}\ndone\n",
        total_jobs, stuck, timeout_rate, cancel_rate
    ))
}

fn severity(outcome: &RunOutcome) -> Severity {
    match outcome {
        RunOutcome::Completed { severity, .. } => *severity,
        RunOutcome::Busy => panic!("run was skipped"),
    }
}

fn notified(outcome: &RunOutcome) -> bool {
    matches!(outcome, RunOutcome::Completed { notified: true, .. })
}

#[tokio::test]
async fn test_high_volume_timeout_scenario_warns() {
    let h = Harness::new();
    let outcome = h.watcher(payload(150, 0, 0.25, 0.05)).run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Warning);
    assert_eq!(outcome.exit_code(), 0);
    assert!(notified(&outcome));
    assert_eq!(h.notifier.subjects(), vec!["[kpiwatch][TEST] WARNING 1 condition(s)"]);

    let history = h.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].severity, Severity::Warning);
    assert_eq!(history[0].conditions.len(), 1);
    assert!(history[0].conditions[0].starts_with("WARN TIMEOUT_RATE_HIGH:HIGH"));
    assert_eq!(history[0].baseline.baseline_n, 0);

    // A new warning signal collects evidence and the status mirrors the record.
    assert_eq!(h.evidence_runs(), 1);
    let status = StatusPublisher::new(h.cfg.paths.status_path()).load().unwrap().unwrap();
    assert_eq!(status.run_id, history[0].run_id);
    assert_eq!(status.severity, Severity::Warning);
    assert_eq!(status.evidence, history[0].evidence);
    assert_eq!(status.freshness.get("snapshot").copied().flatten(), Some(0.0));

    assert!(!h.cfg.paths.lock_path().exists());
}

#[tokio::test]
async fn test_repeated_warning_inside_cooldown_notifies_once() {
    let h = Harness::new();
    let now = Utc::now();

    let first = h.watcher(payload(150, 0, 0.25, 0.05)).run_at(now).await.unwrap();
    let second = h
        .watcher(payload(150, 0, 0.26, 0.05))
        .run_at(now + Duration::minutes(10))
        .await
        .unwrap();

    assert!(notified(&first));
    assert!(!notified(&second));
    assert_eq!(severity(&second), Severity::Warning);
    assert_eq!(h.notifier.subjects().len(), 1);
    assert_eq!(h.evidence_runs(), 1);

    let history = h.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].fingerprint, history[1].fingerprint);
    assert!(!history[1].notified);
}

#[tokio::test]
async fn test_repeated_error_always_notifies() {
    let h = Harness::new();
    let now = Utc::now();

    let first = h.watcher(payload(150, 3, 0.0, 0.0)).run_at(now).await.unwrap();
    let second = h
        .watcher(payload(150, 3, 0.0, 0.0))
        .run_at(now + Duration::minutes(1))
        .await
        .unwrap();

    assert_eq!(severity(&first), Severity::Error);
    assert_eq!(first.exit_code(), 1);
    assert!(notified(&first));
    assert!(notified(&second));
    assert_eq!(h.notifier.subjects().len(), 2);
    assert_eq!(h.evidence_runs(), 2);
}

#[tokio::test]
async fn test_success_does_not_notify_or_fingerprint() {
    let h = Harness::new();
    let outcome = h.watcher(payload(50, 0, 0.01, 0.01)).run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Success);
    assert!(!notified(&outcome));
    assert!(h.notifier.subjects().is_empty());
    assert_eq!(h.evidence_runs(), 0);
    assert!(!h.cfg.paths.fingerprint_path(ExecutionMode::Test).exists());
    assert_eq!(h.history().len(), 1);
}

#[tokio::test]
async fn test_busy_run_leaves_no_trace() {
    let h = Harness::new();
    let held = WatchLock::acquire(&h.cfg.paths.lock_path(), StdDuration::from_secs(900)).unwrap();
    assert!(matches!(held, Acquire::Held(_)));

    let outcome = h.watcher(payload(150, 3, 0.0, 0.0)).run_at(Utc::now()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Busy);
    assert_eq!(outcome.exit_code(), 0);

    assert!(h.notifier.subjects().is_empty());
    assert!(!h.cfg.paths.history_path().exists());
    assert!(!h.cfg.paths.status_path().exists());
    assert!(!h.cfg.paths.fingerprint_path(ExecutionMode::Test).exists());
    drop(held);
}

#[tokio::test]
async fn test_missing_snapshot_is_error() {
    let h = Harness::new();
    let outcome = h.watcher(None).run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Error);
    let history = h.history();
    assert!(history[0].snapshot_ts.is_none());
    assert!(history[0]
        .conditions
        .iter()
        .any(|c| c.starts_with("ERROR SNAPSHOT_MISSING")));
    assert_eq!(h.notifier.subjects().len(), 1);
}

#[tokio::test]
async fn test_missing_required_fields_warn() {
    let h = Harness::new();
    let text = r#"{"total_jobs": 50, "stuck": 0, "timeout_rate": 0.0, "cancel_rate": 0.0}"#;
    let outcome = h.watcher(Some(text.to_string())).run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Warning);
    let conditions = &h.history()[0].conditions;
    assert!(conditions.iter().any(|c| c.starts_with("WARN FIELD_MISSING:rows_deleted")));
    assert!(conditions.iter().any(|c| c.starts_with("WARN FIELD_MISSING:total_snapshots")));
}

#[tokio::test]
async fn test_stale_snapshot_is_error() {
    let h = Harness::new();
    let old: DateTime<Utc> = Utc::now() - Duration::hours(30);
    let text = format!(
        r#"{{"timestamp": "{}", "total_jobs": 50, "stuck": 0, "timeout_rate": 0.0, "cancel_rate": 0.0,
        "rows_deleted": 0, "total_snapshots": 1}}"#,
        old.to_rfc3339()
    );
    let outcome = h.watcher(Some(text)).run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Error);
    assert!(h.history()[0]
        .conditions
        .iter()
        .any(|c| c.starts_with("ERROR FRESHNESS_STALE:snapshot")));
}

#[tokio::test]
async fn test_same_snapshot_twice_is_marked_duplicate() {
    let h = Harness::new();
    let ts = Utc::now() - Duration::hours(1);
    let text = format!(
        r#"{{"timestamp": "{}", "total_jobs": 50, "stuck": 0, "timeout_rate": 0.0, "cancel_rate": 0.0,
        "rows_deleted": 0, "total_snapshots": 1}}"#,
        ts.to_rfc3339()
    );
    h.watcher(Some(text.clone())).run_at(Utc::now()).await.unwrap();
    h.watcher(Some(text)).run_at(Utc::now()).await.unwrap();

    let history = h.history();
    assert!(!history[0].duplicate_snapshot);
    assert!(history[1].duplicate_snapshot);
    assert!(history[1].timestamp > history[0].timestamp);
}

#[tokio::test]
async fn test_volume_drop_against_rolling_baseline() {
    let h = Harness::new();
    let now = Utc::now();

    let store = HistoryStore::new(h.cfg.paths.history_path());
    for days in [3, 2, 1] {
        let ts = now - Duration::days(days);
        store
            .append(&AlertRecord {
                timestamp: ts,
                run_id: format!("seed{}", days),
                mode: ExecutionMode::Test,
                severity: Severity::Success,
                window_hours: 168,
                snapshot_ts: Some(ts),
                total_jobs: 100,
                stuck: 0,
                timeout_rate: 0.0,
                cancel_rate: 0.0,
                duplicate_snapshot: false,
                baseline: BaselineFields::default(),
                conditions: Vec::new(),
                fingerprint: None,
                notified: false,
                evidence: None,
                fatal: None,
            })
            .unwrap();
    }

    let outcome = h.watcher(payload(40, 0, 0.0, 0.0)).run_at(now).await.unwrap();
    assert_eq!(severity(&outcome), Severity::Warning);

    let last = h.history().pop().unwrap();
    assert_eq!(last.baseline.baseline_n, 3);
    assert_eq!(last.baseline.baseline_avg_jobs, Some(100.0));
    assert_eq!(last.baseline.delta_jobs, Some(-0.6));
    assert!(last
        .conditions
        .iter()
        .any(|c| c.starts_with("WARN BASELINE_VOLUME_DROP:ROLLING")));
}

#[tokio::test]
async fn test_unexpected_failure_is_recorded_and_lock_released() {
    let h = Harness::new();
    // A directory where the history file should be makes the history unreadable.
    std::fs::create_dir_all(h.cfg.paths.history_path()).unwrap();

    let outcome = h.watcher(payload(50, 0, 0.0, 0.0)).run_at(Utc::now()).await.unwrap();
    assert_eq!(severity(&outcome), Severity::Error);
    assert!(notified(&outcome));

    let status = StatusPublisher::new(h.cfg.paths.status_path()).load().unwrap().unwrap();
    assert_eq!(status.severity, Severity::Error);
    assert!(status.fatal.is_some());
    assert!(status.conditions[0].starts_with("ERROR RUN_FAILED"));
    assert!(h.notifier.subjects()[0].contains("ERROR 1 condition(s)"));

    assert!(h.state_dir().exists());
    assert!(!h.cfg.paths.lock_path().exists());
}

#[tokio::test]
async fn test_failed_evidence_keeps_warning_and_notifies() {
    let h = Harness::new();
    let watcher = Watcher::new(
        h.cfg.clone(),
        ExecutionMode::Test,
        Box::new(FakeSource(payload(150, 0, 0.25, 0.05))),
        Box::new(h.notifier.clone()),
        Some(Box::new(FailingCollector)),
    );
    let outcome = watcher.run_at(Utc::now()).await.unwrap();

    assert_eq!(severity(&outcome), Severity::Warning);
    assert_eq!(outcome.exit_code(), 0);
    assert!(notified(&outcome));
    assert!(matches!(outcome, RunOutcome::Completed { evidence: None, .. }));
    assert_eq!(h.notifier.subjects(), vec!["[kpiwatch][TEST] WARNING 1 condition(s)"]);

    let history = h.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].severity, Severity::Warning);
    assert!(history[0].evidence.is_none());
    let status = StatusPublisher::new(h.cfg.paths.status_path()).load().unwrap().unwrap();
    assert!(status.evidence.is_none());
}
