//! Static thresholds on the current snapshot.
//!
//! Rate thresholds scale with traffic: on quiet days a couple of timeouts
//! would otherwise look like a disaster.

use serde::Serialize;

use super::Condition;
use crate::config::ThresholdConfig;
use crate::snapshot::MetricSnapshot;

/// Traffic tier of a snapshot, derived from `total_jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTier {
    /// Too few jobs for rates to mean anything.
    Low,
    Medium,
    High,
}

impl std::fmt::Display for VolumeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeTier::Low => write!(f, "LOW"),
            VolumeTier::Medium => write!(f, "MEDIUM"),
            VolumeTier::High => write!(f, "HIGH"),
        }
    }
}

/// Conditions raised by the threshold rules, split by class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdReport {
    pub errors: Vec<Condition>,
    pub warnings: Vec<Condition>,
}

impl ThresholdReport {
    /// Errors first, then warnings, each in rule order.
    pub fn into_conditions(self) -> Vec<Condition> {
        let mut all = self.errors;
        all.extend(self.warnings);
        all
    }
}

pub struct ThresholdEvaluator {
    cfg: ThresholdConfig,
}

impl ThresholdEvaluator {
    pub fn new(cfg: ThresholdConfig) -> Self {
        Self { cfg }
    }

    pub fn tier(&self, total_jobs: u64) -> VolumeTier {
        if total_jobs < self.cfg.min_jobs_for_rates {
            VolumeTier::Low
        } else if total_jobs < self.cfg.high_volume_jobs {
            VolumeTier::Medium
        } else {
            VolumeTier::High
        }
    }

    /// Apply the stuck rule and the tiered rate rules.
    pub fn evaluate(&self, snap: &MetricSnapshot) -> ThresholdReport {
        let mut report = ThresholdReport::default();

        // A stuck job never resolves on its own.
        if snap.stuck > 0 {
            report
                .errors
                .push(Condition::error("STUCK_JOBS", format!("stuck={}", snap.stuck)));
        }

        let tier = self.tier(snap.total_jobs);
        let (timeout_limit, cancel_limit) = match tier {
            VolumeTier::Low => return report,
            VolumeTier::Medium => (self.cfg.medium_timeout_rate, self.cfg.medium_cancel_rate),
            VolumeTier::High => (self.cfg.high_timeout_rate, self.cfg.high_cancel_rate),
        };

        if snap.timeout_rate >= timeout_limit {
            report.warnings.push(
                Condition::warning(
                    "TIMEOUT_RATE_HIGH",
                    format!(
                        "timeout_rate={:.4} >= {:.2} (total_jobs={})",
                        snap.timeout_rate, timeout_limit, snap.total_jobs
                    ),
                )
                .with_qualifier(tier.to_string()),
            );
        }

        if snap.cancel_rate >= cancel_limit {
            report.warnings.push(
                Condition::warning(
                    "CANCEL_RATE_HIGH",
                    format!(
                        "cancel_rate={:.4} >= {:.2} (total_jobs={})",
                        snap.cancel_rate, cancel_limit, snap.total_jobs
                    ),
                )
                .with_qualifier(tier.to_string()),
            );
        }

        report
    }

    /// Malformed input: each required field the producer left out is a
    /// warning, never an error. The field itself was already zeroed.
    pub fn missing_fields(&self, missing: &[String]) -> Vec<Condition> {
        missing
            .iter()
            .map(|f| {
                Condition::warning("FIELD_MISSING", format!("'{}' absent, defaulted to 0", f))
                    .with_qualifier(f)
            })
            .collect()
    }
}
