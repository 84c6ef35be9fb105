//! Staleness checks for pipeline outputs.
//!
//! The producer can silently stop running; a clean exit from it is not proof
//! that anything was refreshed. Each monitored artifact is judged by the age of
//! its last known-good output.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use super::Condition;
use crate::config::ArtifactConfig;

/// Outcome of a single freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    Fresh { age_hours: f64 },
    Stale { age_hours: f64 },
    Missing,
}

impl Freshness {
    pub fn age_hours(&self) -> Option<f64> {
        match self {
            Freshness::Fresh { age_hours } | Freshness::Stale { age_hours } => Some(*age_hours),
            Freshness::Missing => None,
        }
    }
}

/// Judge the age of `last_known_good` against `max_silence`. Pure.
///
/// Timestamps in the future (clock skew between hosts) count as age zero.
pub fn check(last_known_good: Option<DateTime<Utc>>, now: DateTime<Utc>, max_silence: Duration) -> Freshness {
    let Some(last) = last_known_good else {
        return Freshness::Missing;
    };
    let age = (now - last).max(Duration::zero());
    let age_hours = age.num_milliseconds() as f64 / 3_600_000.0;
    if age > max_silence {
        Freshness::Stale { age_hours }
    } else {
        Freshness::Fresh { age_hours }
    }
}

/// Convert fractional hours from configuration into a duration.
pub fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.0).round() as i64)
}

/// Result for one named artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactFreshness {
    pub name: String,
    pub max_silence_hours: f64,
    pub freshness: Freshness,
}

impl ArtifactFreshness {
    /// Stale output means the producer stopped: that is an error. An artifact
    /// that never existed is only a warning.
    pub fn condition(&self) -> Option<Condition> {
        match self.freshness {
            Freshness::Fresh { .. } => None,
            Freshness::Stale { age_hours } => Some(
                Condition::error(
                    "FRESHNESS_STALE",
                    format!("age {:.1}h > {:.1}h", age_hours, self.max_silence_hours),
                )
                .with_qualifier(&self.name),
            ),
            Freshness::Missing => Some(
                Condition::warning("FRESHNESS_MISSING", "no output found").with_qualifier(&self.name),
            ),
        }
    }
}

/// Freshness of every monitored artifact in a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FreshnessReport {
    pub artifacts: Vec<ArtifactFreshness>,
}

impl FreshnessReport {
    pub fn push(&mut self, name: impl Into<String>, max_silence_hours: f64, freshness: Freshness) {
        self.artifacts.push(ArtifactFreshness {
            name: name.into(),
            max_silence_hours,
            freshness,
        });
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.artifacts.iter().filter_map(ArtifactFreshness::condition).collect()
    }

    /// Age in hours per artifact, `None` when missing.
    pub fn ages(&self) -> BTreeMap<String, Option<f64>> {
        self.artifacts
            .iter()
            .map(|a| (a.name.clone(), a.freshness.age_hours().map(|h| crate::round_to(h, 3))))
            .collect()
    }
}

/// Last modification time of a file, `None` if it does not exist or cannot be read.
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => Some(t.into()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "artifact not readable");
            None
        }
    }
}

/// Probe every configured file artifact.
pub fn probe_artifacts(artifacts: &[ArtifactConfig], now: DateTime<Utc>, report: &mut FreshnessReport) {
    for artifact in artifacts {
        let freshness = check(file_mtime(&artifact.path), now, hours(artifact.max_silence_hours));
        report.push(&artifact.name, artifact.max_silence_hours, freshness);
    }
}
