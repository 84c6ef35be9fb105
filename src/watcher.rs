//! One watcher run, end to end.
//!
//! guard -> history -> snapshot -> freshness -> thresholds -> baseline ->
//! severity -> dedup -> fingerprint -> evidence -> history append -> status ->
//! notification.
//!
//! Everything after the severity is resolved is best-effort: failures are
//! logged and never change the outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WatchConfig;
use crate::dedup::{Decision, Deduplicator, FingerprintStore};
use crate::detect::baseline::{BaselineEngine, BaselineFields};
use crate::detect::freshness::{self, FreshnessReport};
use crate::detect::threshold::ThresholdEvaluator;
use crate::detect::{resolve, Condition, Severity};
use crate::evidence::{self, EvidenceCollector, EvidenceRequest};
use crate::guard::{Acquire, LockError, WatchLock};
use crate::notify::{self, MultiNotifier, Notifier};
use crate::snapshot::{self, CommandSource, MetricSnapshot, ParsedSnapshot, SnapshotSource};
use crate::status::{StatusDocument, StatusPublisher};
use crate::storage::history::next_timestamp;
use crate::storage::{AlertRecord, HistoryStore};
use crate::ExecutionMode;

/// What a run ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run holds the lock; nothing was evaluated or written.
    Busy,
    Completed {
        run_id: String,
        severity: Severity,
        notified: bool,
        evidence: Option<PathBuf>,
    },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Busy => 0,
            RunOutcome::Completed { severity, .. } => severity.exit_code(),
        }
    }
}

/// State of one evaluated run, ready to be recorded.
struct Evaluation {
    record: AlertRecord,
    freshness: BTreeMap<String, Option<f64>>,
    decision: Decision,
    context: Value,
}

pub struct Watcher {
    cfg: WatchConfig,
    mode: ExecutionMode,
    source: Box<dyn SnapshotSource>,
    notifier: Box<dyn Notifier>,
    collector: Option<Box<dyn EvidenceCollector>>,
}

impl Watcher {
    pub fn new(
        cfg: WatchConfig,
        mode: ExecutionMode,
        source: Box<dyn SnapshotSource>,
        notifier: Box<dyn Notifier>,
        collector: Option<Box<dyn EvidenceCollector>>,
    ) -> Self {
        Self {
            cfg,
            mode,
            source,
            notifier,
            collector,
        }
    }

    /// Watcher wired to the configured command, channels and collector.
    pub fn from_config(cfg: WatchConfig, mode: ExecutionMode) -> Self {
        let source = Box::new(CommandSource::from_config(&cfg.snapshot));
        let notifier = Box::new(MultiNotifier::from_config(&cfg.notify));
        let collector = evidence::from_config(&cfg.evidence);
        Self::new(cfg, mode, source, notifier, collector)
    }

    pub async fn run(&self) -> Result<RunOutcome, LockError> {
        self.run_at(Utc::now()).await
    }

    /// Execute one run as of `now`.
    ///
    /// Only a failure to take the lock is returned as an error. Anything that
    /// goes wrong during evaluation becomes an ERROR record.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunOutcome, LockError> {
        let paths = &self.cfg.paths;
        let stale_after = Duration::from_secs(self.cfg.lock.stale_after_sec);
        let _lock = match WatchLock::acquire(&paths.lock_path(), stale_after)? {
            Acquire::Held(lock) => lock,
            Acquire::Busy => {
                debug!(mode = %self.mode, "another run is in progress, skipping");
                return Ok(RunOutcome::Busy);
            }
        };

        let mut run_id = Uuid::new_v4().simple().to_string();
        run_id.truncate(12);
        info!(%run_id, mode = %self.mode, "watcher run started");

        let dedup = Deduplicator::new(
            self.cfg.dedup.clone(),
            FingerprintStore::new(paths.fingerprint_path(self.mode)),
        );

        let history = HistoryStore::new(paths.history_path()).load();
        // Without a readable history there is nothing to order against.
        let timestamp = match &history {
            Ok(history) => next_timestamp(history, now),
            Err(_) => now,
        };

        let evaluated = match history {
            Ok(history) => {
                debug!(records = history.len(), "history loaded");
                self.evaluate(now, timestamp, &history, &run_id, &dedup).await
            }
            Err(e) => Err(e),
        };
        let eval = match evaluated {
            Ok(eval) => eval,
            Err(e) => {
                error!(%run_id, error = %e, "run failed");
                self.fatal(now, timestamp, &run_id, &dedup, &e)
            }
        };

        Ok(self.finish(eval, now, &dedup).await)
    }

    async fn evaluate(
        &self,
        now: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        history: &[AlertRecord],
        run_id: &str,
        dedup: &Deduplicator,
    ) -> Result<Evaluation> {
        let mut conditions = Vec::new();

        let parsed = match self.fetch_snapshot(now).await {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(%run_id, error = %e, "no snapshot available");
                conditions.push(Condition::error("SNAPSHOT_MISSING", e.to_string()));
                None
            }
        };

        // Freshness: the snapshot itself, falling back to the last one recorded.
        let mut report = FreshnessReport::default();
        let last_good = parsed
            .as_ref()
            .map(|p| p.snapshot.timestamp)
            .or_else(|| history.iter().rev().find_map(|r| r.snapshot_ts));
        let max_silence = self.cfg.freshness.max_silence_hours;
        report.push(
            "snapshot",
            max_silence,
            freshness::check(last_good, now, freshness::hours(max_silence)),
        );
        freshness::probe_artifacts(&self.cfg.freshness.artifacts, now, &mut report);
        conditions.extend(report.conditions());

        let snap = parsed
            .as_ref()
            .map(|p| p.snapshot.clone())
            .unwrap_or_else(|| MetricSnapshot::empty(now, self.cfg.snapshot.window_hours));

        let mut duplicate_snapshot = false;
        let mut baseline = BaselineFields::default();
        if let Some(p) = &parsed {
            let thresholds = ThresholdEvaluator::new(self.cfg.thresholds.clone());
            conditions.extend(thresholds.evaluate(&snap).into_conditions());
            conditions.extend(thresholds.missing_fields(&p.missing));

            duplicate_snapshot = history
                .iter()
                .rev()
                .find_map(|r| r.snapshot_ts)
                .is_some_and(|ts| ts == snap.timestamp);
            if duplicate_snapshot {
                debug!(snapshot_ts = %snap.timestamp, "snapshot already recorded");
            }

            let result = BaselineEngine::new(self.cfg.baseline.clone()).evaluate(&snap, now, history);
            debug!(
                rolling_n = result.rolling.n,
                dow_n = result.day_of_week.n,
                warnings = result.warnings.len(),
                "baseline evaluated"
            );
            baseline = result.fields();
            conditions.extend(result.warnings);
        }

        let severity = resolve(&conditions);
        let signals: Vec<String> = conditions.iter().map(Condition::signal).collect();
        let decision = dedup.decide(severity, &signals, now);

        let record = AlertRecord {
            timestamp,
            run_id: run_id.to_string(),
            mode: self.mode,
            severity,
            window_hours: snap.window_hours,
            snapshot_ts: parsed.as_ref().map(|p| p.snapshot.timestamp),
            total_jobs: snap.total_jobs,
            stuck: snap.stuck,
            timeout_rate: snap.timeout_rate,
            cancel_rate: snap.cancel_rate,
            duplicate_snapshot,
            baseline,
            conditions: conditions.iter().map(ToString::to_string).collect(),
            fingerprint: Some(decision.fingerprint.clone()),
            notified: decision.notify,
            evidence: None,
            fatal: None,
        };

        let freshness = report.ages();
        let context = json!({
            "severity": severity,
            "conditions": record.conditions,
            "signals": signals,
            "snapshot": parsed.as_ref().map(|p| json!({
                "metrics": p.snapshot,
                "rows_deleted": p.rows_deleted,
                "total_snapshots": p.total_snapshots,
                "missing_fields": p.missing,
                "payload": p.payload,
            })),
            "freshness": freshness,
            "baseline": record.baseline,
            "duplicate_snapshot": duplicate_snapshot,
        });

        Ok(Evaluation {
            record,
            freshness,
            decision,
            context,
        })
    }

    async fn fetch_snapshot(&self, now: DateTime<Utc>) -> Result<ParsedSnapshot, snapshot::SnapshotError> {
        let text = self.source.fetch().await?;
        snapshot::parse_output(
            &text,
            now,
            self.cfg.snapshot.window_hours,
            &self.cfg.snapshot.required_fields,
        )
    }

    /// ERROR record for a run that could not be evaluated, stamped with
    /// `timestamp` so history stays ordered.
    fn fatal(
        &self,
        now: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        run_id: &str,
        dedup: &Deduplicator,
        err: &anyhow::Error,
    ) -> Evaluation {
        let message = format!("{:#}", err);
        let condition = Condition::error("RUN_FAILED", message.clone());
        let decision = dedup.decide(Severity::Error, &[condition.signal()], now);

        let record = AlertRecord {
            timestamp,
            run_id: run_id.to_string(),
            mode: self.mode,
            severity: Severity::Error,
            window_hours: self.cfg.snapshot.window_hours,
            snapshot_ts: None,
            total_jobs: 0,
            stuck: 0,
            timeout_rate: 0.0,
            cancel_rate: 0.0,
            duplicate_snapshot: false,
            baseline: BaselineFields::default(),
            conditions: vec![condition.to_string()],
            fingerprint: Some(decision.fingerprint.clone()),
            notified: decision.notify,
            evidence: None,
            fatal: Some(message.clone()),
        };

        Evaluation {
            context: json!({ "severity": Severity::Error, "fatal": message }),
            record,
            freshness: BTreeMap::new(),
            decision,
        }
    }

    /// Record the evaluation and send the notification.
    async fn finish(&self, eval: Evaluation, now: DateTime<Utc>, dedup: &Deduplicator) -> RunOutcome {
        let Evaluation {
            mut record,
            freshness,
            decision,
            context,
        } = eval;
        let run_id = record.run_id.clone();

        if let Err(e) = dedup.commit(&decision, now) {
            error!(%run_id, error = %e, "failed to persist fingerprint");
        }

        let collect = evidence::should_collect(
            record.severity,
            decision.fingerprint_changed,
            decision.cooldown_ok,
            self.cfg.dedup.collect_on_warn,
        );
        let mut evidence_path = None;
        if let (true, Some(collector)) = (collect, &self.collector) {
            let request = EvidenceRequest {
                mode: self.mode,
                run_id: run_id.clone(),
                output_dir: self.cfg.paths.evidence_dir(),
                context,
            };
            match collector.collect(&request).await {
                Ok(path) => {
                    info!(%run_id, path = %path.display(), "evidence collected");
                    record.evidence = Some(path.display().to_string());
                    evidence_path = Some(path);
                }
                Err(e) => warn!(%run_id, error = %e, "evidence collection failed"),
            }
        }

        let store = HistoryStore::new(self.cfg.paths.history_path());
        if let Err(e) = store.append(&record) {
            error!(%run_id, error = %e, "failed to append alert record");
        }

        let publisher = StatusPublisher::new(self.cfg.paths.status_path());
        if let Err(e) = publisher.publish(&StatusDocument::from_record(&record, freshness)) {
            error!(%run_id, error = %e, "failed to publish status");
        }

        info!(
            %run_id,
            mode = %self.mode,
            severity = %record.severity,
            conditions = record.conditions.len(),
            notify = decision.notify,
            reason = %decision.reason,
            "watcher run complete"
        );

        if decision.notify {
            let subject = notify::subject(self.mode, record.severity, record.conditions.len());
            self.notifier.send(&subject, &notify::body(&record)).await;
        }

        RunOutcome::Completed {
            run_id,
            severity: record.severity,
            notified: decision.notify,
            evidence: evidence_path,
        }
    }
}
