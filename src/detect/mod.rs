//! Anomaly detection: freshness, thresholds, baselines and severity resolution.

pub mod baseline;
pub mod freshness;
pub mod threshold;

use serde::{Deserialize, Serialize};

/// Resolved health state of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Success => write!(f, "SUCCESS"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

impl Severity {
    /// Process exit code for automation. Warnings are non-fatal.
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Success | Severity::Warning => 0,
            Severity::Error => 1,
        }
    }
}

/// Class of a single detected condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Warning,
    Error,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Warning => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// A detected condition raised by one of the probes.
///
/// The `signal` (level, code and optional qualifier) identifies *what* is wrong
/// and feeds the fingerprint. The `detail` carries the observed numbers and is
/// only for humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub level: Level,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    pub detail: String,
}

impl Condition {
    pub fn error(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            code: code.into(),
            qualifier: None,
            detail: detail.into(),
        }
    }

    pub fn warning(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            code: code.into(),
            qualifier: None,
            detail: detail.into(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Stable identity of the condition, free of volatile measurements.
    ///
    /// Level, code and qualifier are the substantive content and feed the
    /// fingerprint. Numbers in `detail` (stuck counts, rates, ages, deltas)
    /// are not: `stuck=1` and `stuck=5` are the same signal, while a tier
    /// moving from MEDIUM to HIGH is a new one.
    pub fn signal(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{} {}:{}", self.level, self.code, q),
            None => format!("{} {}", self.level, self.code),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.signal(), self.detail)
    }
}

/// Merge all conditions of a run into one severity.
///
/// Any error wins over any number of warnings; no conditions at all is a
/// success.
pub fn resolve(conditions: &[Condition]) -> Severity {
    conditions.iter().fold(Severity::Success, |acc, c| {
        let level = match c.level {
            Level::Warning => Severity::Warning,
            Level::Error => Severity::Error,
        };
        acc.max(level)
    })
}
