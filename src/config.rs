//! TOML configuration for the watcher.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The value is immutable once loaded and
//! handed to each component at construction.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ExecutionMode;

/// Environment variable that points at a config file.
pub const CONFIG_ENV: &str = "KPIWATCH_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/kpiwatch/kpiwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the watcher process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded watcher configuration");
        Ok(config)
    }

    /// Resolve the configuration, in order:
    /// 1. An explicit path (`--config`). Failing to load it is an error.
    /// 2. The path in `KPIWATCH_CONFIG`.
    /// 3. `/etc/kpiwatch/kpiwatch.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "KPIWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Where the watcher keeps its state between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for history, status, fingerprint and lock files.
    pub state_dir: PathBuf,
    /// Directory where evidence packs are written. Defaults to `<state_dir>/evidence`.
    pub evidence_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/kpiwatch"),
            evidence_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join("alert_history.jsonl")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("kpiwatch.lock")
    }

    pub fn fingerprint_path(&self, mode: ExecutionMode) -> PathBuf {
        self.state_dir.join(format!("fingerprint_{}.json", mode))
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.evidence_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("evidence"))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// How the KPI snapshot is obtained from the business pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Program to run. Its stdout must contain one JSON object.
    pub command: String,
    /// Arguments passed to `command`.
    pub args: Vec<String>,
    /// Hard limit for the command, in seconds.
    pub timeout_sec: u64,
    /// Lookback window the snapshot covers when the payload does not say.
    pub window_hours: u32,
    /// Fields whose absence downgrades the run to WARNING.
    pub required_fields: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            command: "python".to_string(),
            args: vec![
                "manage.py".to_string(),
                "kpi_snapshot".to_string(),
                "--hours".to_string(),
                "168".to_string(),
            ],
            timeout_sec: 120,
            window_hours: 168,
            required_fields: vec![
                "total_jobs".to_string(),
                "rows_deleted".to_string(),
                "total_snapshots".to_string(),
                "timeout_rate".to_string(),
                "cancel_rate".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

/// Staleness limits for the snapshot and any extra monitored artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Maximum allowed age of the snapshot itself, in hours.
    pub max_silence_hours: f64,
    /// Extra files whose modification time must stay recent.
    pub artifacts: Vec<ArtifactConfig>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            max_silence_hours: 26.0,
            artifacts: Vec::new(),
        }
    }
}

/// A file produced by the pipeline that must be refreshed periodically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub name: String,
    pub path: PathBuf,
    pub max_silence_hours: f64,
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Static, volume-tiered thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Below this many jobs rate rules are ignored.
    pub min_jobs_for_rates: u64,
    /// At or above this many jobs the high-volume tier applies.
    pub high_volume_jobs: u64,
    pub medium_timeout_rate: f64,
    pub medium_cancel_rate: f64,
    pub high_timeout_rate: f64,
    pub high_cancel_rate: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_jobs_for_rates: 20,
            high_volume_jobs: 100,
            medium_timeout_rate: 0.30,
            medium_cancel_rate: 0.15,
            high_timeout_rate: 0.20,
            high_cancel_rate: 0.10,
        }
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Historical baseline comparison parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub rolling_days: i64,
    pub rolling_min_points: usize,
    /// Day-of-week lookback; unset means the rolling window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dow_lookback_days: Option<i64>,
    /// Leave records from the current local date out of the day-of-week set.
    pub dow_exclude_today: bool,
    pub dow_hour_window: u32,
    pub dow_min_points: usize,
    /// Offset applied before taking weekday and hour-of-day.
    pub utc_offset_hours: i32,
    /// Volume-drop rule only applies when the average is at least this.
    pub volume_drop_min_avg: f64,
    pub volume_drop_ratio: f64,
    pub timeout_spike: f64,
    pub cancel_spike: f64,
    pub dow_timeout_spike: f64,
    pub dow_cancel_spike: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            rolling_days: 7,
            rolling_min_points: 3,
            dow_lookback_days: None,
            dow_exclude_today: false,
            dow_hour_window: 2,
            dow_min_points: 2,
            utc_offset_hours: 0,
            volume_drop_min_avg: 10.0,
            volume_drop_ratio: -0.50,
            timeout_spike: 0.15,
            cancel_spike: 0.08,
            dow_timeout_spike: 0.12,
            dow_cancel_spike: 0.06,
        }
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Notification noise control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Minimum time between two WARNING notifications.
    pub cooldown_minutes: i64,
    /// A WARNING only notifies when its fingerprint differs from the last one sent.
    pub warn_needs_new_signal: bool,
    /// Collect evidence for WARNING runs that pass the cooldown gate.
    pub collect_on_warn: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 60,
            warn_needs_new_signal: true,
            collect_on_warn: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// A held lock whose heartbeat is older than this is reclaimed.
    pub stale_after_sec: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_sec: 900,
        }
    }
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Evidence pack collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub enabled: bool,
    /// External collector. When unset, a JSON bundle is written by the watcher.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Appended after `args` on every run; `{run_id}`, `{out_dir}` and
    /// `{mode}` are substituted.
    pub run_args: Vec<String>,
    pub timeout_sec: u64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            args: Vec::new(),
            run_args: crate::evidence::DEFAULT_RUN_ARGS.iter().map(|a| a.to_string()).collect(),
            timeout_sec: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Notification channels. All of them are best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Always log notifications through tracing.
    pub log: bool,
    /// POST `{subject, body}` as JSON to this URL.
    pub webhook_url: Option<String>,
    /// Program that receives the body on stdin. `{subject}` in args is substituted.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_sec: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
            command: None,
            args: Vec::new(),
            timeout_sec: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
