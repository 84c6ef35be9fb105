//! Append-only alert history (newline-delimited JSON).
//!
//! One [`AlertRecord`] per run. Lines are never rewritten; the file is read in
//! full on every run, which stays cheap because external retention bounds it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detect::baseline::BaselineFields;
use crate::detect::Severity;
use crate::ExecutionMode;

/// Audit record of a single watcher run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub severity: Severity,
    #[serde(default)]
    pub window_hours: u32,
    /// Identity of the observed snapshot, absent when none was obtained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_jobs: u64,
    #[serde(default)]
    pub stuck: u64,
    #[serde(default)]
    pub timeout_rate: f64,
    #[serde(default)]
    pub cancel_rate: f64,
    /// Same snapshot already recorded by an earlier run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate_snapshot: bool,
    #[serde(flatten)]
    pub baseline: BaselineFields,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub notified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

impl AlertRecord {
    /// Whether the record may feed a baseline average.
    pub fn is_baseline_candidate(&self) -> bool {
        let healthy_enough = match self.severity {
            Severity::Success | Severity::Warning => true,
            Severity::Error => false,
        };
        healthy_enough && !self.duplicate_snapshot && self.snapshot_ts.is_some()
    }
}

/// Handle to the history file.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is an empty history; malformed
    /// lines are skipped and logged.
    pub fn load(&self) -> Result<Vec<AlertRecord>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no history yet");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open history: {}", self.path.display()))
            }
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("failed to read history: {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertRecord>(&line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(line = idx + 1, error = %e, "skipping malformed history line"),
            }
        }
        Ok(records)
    }

    /// Most recent `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let mut records = self.load()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }

    /// Append one record as a single JSON line and sync it to disk.
    pub fn append(&self, record: &AlertRecord) -> Result<()> {
        super::ensure_parent_dir(&self.path)?;
        let mut line = serde_json::to_string(record).context("failed to serialize alert record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open history: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to history: {}", self.path.display()))?;
        file.sync_data()?;
        Ok(())
    }
}

/// Timestamp for the next record: `now`, unless that would not be strictly
/// after the last record, in which case one microsecond past it.
pub fn next_timestamp(history: &[AlertRecord], now: DateTime<Utc>) -> DateTime<Utc> {
    match history.last() {
        Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
        _ => now,
    }
}
