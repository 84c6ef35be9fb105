//! Latest resolved health state, for dashboards and health checks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::Severity;
use crate::storage::{self, AlertRecord};
use crate::ExecutionMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ts: Option<DateTime<Utc>>,
    pub window_hours: u32,
    pub total_jobs: u64,
    pub stuck: u64,
    pub timeout_rate: f64,
    pub cancel_rate: f64,
}

/// Overwritten by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub mode: ExecutionMode,
    pub severity: Severity,
    pub conditions: Vec<String>,
    /// Age in hours of each monitored artifact, `null` when missing.
    #[serde(default)]
    pub freshness: BTreeMap<String, Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub notified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub metrics: StatusMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

impl StatusDocument {
    /// Status mirroring the record appended by the same run.
    pub fn from_record(record: &AlertRecord, freshness: BTreeMap<String, Option<f64>>) -> Self {
        Self {
            generated_at: record.timestamp,
            run_id: record.run_id.clone(),
            mode: record.mode,
            severity: record.severity,
            conditions: record.conditions.clone(),
            freshness,
            evidence: record.evidence.clone(),
            notified: record.notified,
            fingerprint: record.fingerprint.clone(),
            metrics: StatusMetrics {
                snapshot_ts: record.snapshot_ts,
                window_hours: record.window_hours,
                total_jobs: record.total_jobs,
                stuck: record.stuck,
                timeout_rate: record.timeout_rate,
                cancel_rate: record.cancel_rate,
            },
            fatal: record.fatal.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusPublisher {
    path: PathBuf,
}

impl StatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the document atomically; readers never see a partial write.
    pub fn publish(&self, doc: &StatusDocument) -> Result<()> {
        storage::write_json(&self.path, doc)
    }

    pub fn load(&self) -> Result<Option<StatusDocument>> {
        storage::read_json(&self.path)
    }
}
