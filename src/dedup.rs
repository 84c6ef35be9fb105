//! Alert deduplication by condition fingerprint.
//!
//! The fingerprint identifies the *set* of active signals. Errors always
//! notify. Warnings are rate limited by a cooldown and, by default, only
//! re-notify when the set of signals changed.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::DedupConfig;
use crate::detect::Severity;
use crate::storage;

/// SHA-256 hex over the normalized signals.
///
/// Signals are trimmed, inner whitespace collapsed, uppercased, deduplicated
/// and sorted before hashing, so order and formatting never matter.
pub fn fingerprint<S: AsRef<str>>(signals: &[S]) -> String {
    let mut normalized: Vec<String> = signals
        .iter()
        .map(|s| s.as_ref().split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();

    let mut hasher = Sha256::new();
    hasher.update(normalized.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

/// Last notified fingerprint for one execution mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

/// One JSON document per mode, replaced atomically.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    path: PathBuf,
}

impl FingerprintStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last record, `None` if never written. A corrupt file is treated as
    /// absent so a bad write can only cause one extra notification.
    pub fn load(&self) -> Option<FingerprintRecord> {
        match storage::read_json(&self.path) {
            Ok(rec) => rec,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable fingerprint state");
                None
            }
        }
    }

    pub fn save(&self, record: &FingerprintRecord) -> Result<()> {
        storage::write_json(&self.path, record)
    }
}

/// Why a run did or did not notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ErrorAlways,
    NewSignal,
    RepeatAllowed,
    Cooldown,
    SameSignal,
    Healthy,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::ErrorAlways => write!(f, "error_always"),
            Reason::NewSignal => write!(f, "new_signal"),
            Reason::RepeatAllowed => write!(f, "repeat_allowed"),
            Reason::Cooldown => write!(f, "cooldown"),
            Reason::SameSignal => write!(f, "same_signal"),
            Reason::Healthy => write!(f, "healthy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub notify: bool,
    pub reason: Reason,
    pub fingerprint: String,
    pub fingerprint_changed: bool,
    pub cooldown_ok: bool,
}

pub struct Deduplicator {
    cfg: DedupConfig,
    store: FingerprintStore,
}

impl Deduplicator {
    pub fn new(cfg: DedupConfig, store: FingerprintStore) -> Self {
        Self { cfg, store }
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    /// Decide against the persisted state.
    pub fn decide(&self, severity: Severity, signals: &[String], now: DateTime<Utc>) -> Decision {
        let last = self.store.load();
        decide(&self.cfg, last.as_ref(), severity, signals, now)
    }

    /// Persist the fingerprint of a decision that notifies. Must happen before
    /// dispatch; a failed dispatch does not undo it.
    pub fn commit(&self, decision: &Decision, now: DateTime<Utc>) -> Result<()> {
        if !decision.notify {
            return Ok(());
        }
        self.store.save(&FingerprintRecord {
            fingerprint: decision.fingerprint.clone(),
            timestamp: now,
        })?;
        debug!(fingerprint = %decision.fingerprint, "fingerprint persisted");
        Ok(())
    }
}

/// Pure notification decision.
pub fn decide(
    cfg: &DedupConfig,
    last: Option<&FingerprintRecord>,
    severity: Severity,
    signals: &[String],
    now: DateTime<Utc>,
) -> Decision {
    let fp = fingerprint(signals);
    let fingerprint_changed = last.map_or(true, |l| l.fingerprint != fp);
    let cooldown_ok =
        last.map_or(true, |l| now - l.timestamp >= Duration::minutes(cfg.cooldown_minutes));

    let (notify, reason) = match severity {
        Severity::Error => (true, Reason::ErrorAlways),
        Severity::Warning => {
            if !cooldown_ok {
                (false, Reason::Cooldown)
            } else if fingerprint_changed {
                (true, Reason::NewSignal)
            } else if !cfg.warn_needs_new_signal {
                (true, Reason::RepeatAllowed)
            } else {
                (false, Reason::SameSignal)
            }
        }
        Severity::Success => (false, Reason::Healthy),
    };

    Decision {
        notify,
        reason,
        fingerprint: fp,
        fingerprint_changed,
        cooldown_ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap()
    }

    fn signals(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fingerprint_ignores_order_case_and_whitespace() {
        let a = fingerprint(&["WARN TIMEOUT_RATE_HIGH:HIGH", "ERROR STUCK_JOBS"]);
        let b = fingerprint(&["  error   stuck_jobs ", "warn timeout_rate_high:high"]);
        let c = fingerprint(&["ERROR STUCK_JOBS", "WARN TIMEOUT_RATE_HIGH:HIGH", "ERROR STUCK_JOBS"]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = fingerprint(&["WARN TIMEOUT_RATE_HIGH:HIGH"]);
        let b = fingerprint(&["WARN TIMEOUT_RATE_HIGH:MEDIUM"]);
        let c = fingerprint(&["WARN CANCEL_RATE_HIGH:HIGH"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, fingerprint::<&str>(&[]));
    }

    #[test]
    fn test_error_bypasses_cooldown() {
        let cfg = DedupConfig::default();
        let s = signals(&["ERROR STUCK_JOBS"]);
        let first = decide(&cfg, None, Severity::Error, &s, now());
        assert!(first.notify);

        let last = FingerprintRecord {
            fingerprint: first.fingerprint.clone(),
            timestamp: now(),
        };
        let second = decide(&cfg, Some(&last), Severity::Error, &s, now() + Duration::minutes(5));
        assert!(second.notify);
        assert_eq!(second.reason, Reason::ErrorAlways);
        assert!(!second.fingerprint_changed);
        assert!(!second.cooldown_ok);
    }

    #[test]
    fn test_repeat_warning_suppressed_inside_cooldown() {
        let cfg = DedupConfig::default();
        let s = signals(&["WARN TIMEOUT_RATE_HIGH:HIGH"]);
        let first = decide(&cfg, None, Severity::Warning, &s, now());
        assert!(first.notify);
        assert_eq!(first.reason, Reason::NewSignal);

        let last = FingerprintRecord {
            fingerprint: first.fingerprint,
            timestamp: now(),
        };
        let second = decide(&cfg, Some(&last), Severity::Warning, &s, now() + Duration::minutes(10));
        assert!(!second.notify);
        assert_eq!(second.reason, Reason::Cooldown);
    }

    #[test]
    fn test_warning_after_cooldown_needs_new_signal() {
        let cfg = DedupConfig::default();
        let s = signals(&["WARN TIMEOUT_RATE_HIGH:HIGH"]);
        let last = FingerprintRecord {
            fingerprint: fingerprint(&s),
            timestamp: now() - Duration::minutes(61),
        };

        let same = decide(&cfg, Some(&last), Severity::Warning, &s, now());
        assert!(!same.notify);
        assert_eq!(same.reason, Reason::SameSignal);

        let other = signals(&["WARN CANCEL_RATE_HIGH:HIGH"]);
        let changed = decide(&cfg, Some(&last), Severity::Warning, &other, now());
        assert!(changed.notify);

        let relaxed = DedupConfig {
            warn_needs_new_signal: false,
            ..DedupConfig::default()
        };
        let repeat = decide(&relaxed, Some(&last), Severity::Warning, &s, now());
        assert!(repeat.notify);
        assert_eq!(repeat.reason, Reason::RepeatAllowed);
    }

    #[test]
    fn test_success_never_notifies() {
        let cfg = DedupConfig::default();
        let d = decide(&cfg, None, Severity::Success, &[], now());
        assert!(!d.notify);
        assert_eq!(d.reason, Reason::Healthy);
    }

    #[test]
    fn test_commit_only_when_notifying() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FingerprintStore::new(dir.path().join("fingerprint_prod.json"));
        let dedup = Deduplicator::new(DedupConfig::default(), store.clone());

        let quiet = dedup.decide(Severity::Success, &[], now());
        dedup.commit(&quiet, now()).unwrap();
        assert!(store.load().is_none());

        let s = signals(&["ERROR STUCK_JOBS"]);
        let loud = dedup.decide(Severity::Error, &s, now());
        dedup.commit(&loud, now()).unwrap();
        let saved = store.load().unwrap();
        assert_eq!(saved.fingerprint, loud.fingerprint);
        assert_eq!(saved.timestamp, now());
    }

    #[test]
    fn test_corrupt_store_reads_as_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fingerprint_prod.json");
        std::fs::write(&path, "garbage").unwrap();
        assert!(FingerprintStore::new(path).load().is_none());
    }
}
