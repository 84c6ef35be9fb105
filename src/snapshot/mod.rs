//! KPI snapshot model and parsing of the pipeline's textual output.

pub mod source;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::process::CommandError;

pub use self::source::{CommandSource, SnapshotSource};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("pipeline command failed: {0}")]
    Command(#[from] CommandError),
    #[error("pipeline output contains no JSON object")]
    NoJson,
    #[error("pipeline output is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A point-in-time set of business metrics. Identity is `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub window_hours: u32,
    pub total_jobs: u64,
    pub stuck: u64,
    pub timeout_rate: f64,
    pub cancel_rate: f64,
}

impl MetricSnapshot {
    /// Neutral snapshot used when nothing could be observed, so downstream
    /// math stays defined.
    pub fn empty(timestamp: DateTime<Utc>, window_hours: u32) -> Self {
        Self {
            timestamp,
            window_hours,
            total_jobs: 0,
            stuck: 0,
            timeout_rate: 0.0,
            cancel_rate: 0.0,
        }
    }
}

/// A snapshot plus the pipeline maintenance counters and the list of
/// required fields that were missing (and defaulted to zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSnapshot {
    pub snapshot: MetricSnapshot,
    pub rows_deleted: u64,
    pub total_snapshots: u64,
    pub missing: Vec<String>,
    /// Raw payload, kept for evidence packs.
    #[serde(skip)]
    pub payload: Value,
}

/// Parse the stdout of the snapshot command.
///
/// The JSON object may be surrounded by log lines; everything from the first
/// `{` to the last `}` is parsed. Fields are looked up under their flat name
/// first and then under the dashboard layout (`funnel_counts.posted`,
/// `rates.*`, `stuck_preview`).
pub fn parse_output(
    text: &str,
    observed_at: DateTime<Utc>,
    default_window_hours: u32,
    required_fields: &[String],
) -> Result<ParsedSnapshot, SnapshotError> {
    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return Err(SnapshotError::NoJson),
    };
    let payload: Value = serde_json::from_str(&text[start..=end])?;
    if !payload.is_object() {
        return Err(SnapshotError::NoJson);
    }

    let mut missing = Vec::new();
    let mut require = |name: &str, found: bool| {
        if !found && required_fields.iter().any(|f| f == name) {
            missing.push(name.to_string());
        }
    };

    let total_jobs = lookup_u64(&payload, &[&["total_jobs"], &["funnel_counts", "posted"]]);
    require("total_jobs", total_jobs.is_some());

    let timeout_rate = lookup_rate(&payload, &[&["timeout_rate"], &["rates", "timeout_rate"]]);
    require("timeout_rate", timeout_rate.is_some());

    let cancel_rate = lookup_rate(&payload, &[&["cancel_rate"], &["rates", "cancel_rate"]]);
    require("cancel_rate", cancel_rate.is_some());

    let rows_deleted = lookup_u64(&payload, &[&["rows_deleted"], &["maintenance", "rows_deleted"]]);
    require("rows_deleted", rows_deleted.is_some());

    let total_snapshots = lookup_u64(
        &payload,
        &[&["total_snapshots"], &["maintenance", "total_snapshots"]],
    );
    require("total_snapshots", total_snapshots.is_some());

    let stuck = lookup_u64(&payload, &[&["stuck"], &["stuck_count"]]).or_else(|| {
        payload
            .get("stuck_preview")
            .and_then(Value::as_array)
            .map(|a| a.len() as u64)
    });
    require("stuck", stuck.is_some());

    let timestamp = ["timestamp", "generated_at", "created_at"]
        .iter()
        .filter_map(|k| payload.get(*k).and_then(Value::as_str))
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(observed_at);

    let window_hours = lookup_u64(&payload, &[&["window_hours"], &["since_hours"]])
        .and_then(|w| u32::try_from(w).ok())
        .unwrap_or(default_window_hours);

    Ok(ParsedSnapshot {
        snapshot: MetricSnapshot {
            timestamp,
            window_hours,
            total_jobs: total_jobs.unwrap_or(0),
            stuck: stuck.unwrap_or(0),
            timeout_rate: timeout_rate.unwrap_or(0.0),
            cancel_rate: cancel_rate.unwrap_or(0.0),
        },
        rows_deleted: rows_deleted.unwrap_or(0),
        total_snapshots: total_snapshots.unwrap_or(0),
        missing,
        payload,
    })
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |v, key| v.get(*key))
}

/// First path that resolves to a non-negative integer. Integral floats and
/// numeric strings are accepted since the producer is not strictly typed.
fn lookup_u64(payload: &Value, paths: &[&[&str]]) -> Option<u64> {
    paths.iter().find_map(|p| match lookup(payload, p)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// First path that resolves to a finite rate in `[0, 1]`.
fn lookup_rate(payload: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|p| {
        let v = match lookup(payload, p)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }?;
        (v.is_finite() && (0.0..=1.0).contains(&v)).then_some(v)
    })
}
