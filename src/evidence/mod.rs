//! Evidence pack capture.
//!
//! When a run is bad enough, a snapshot of the surrounding state is written
//! for later investigation. Collection is best-effort: a failed collector is
//! logged by the caller and never changes the run's severity.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::EvidenceConfig;
use crate::detect::Severity;
use crate::process::{self, CommandError};
use crate::ExecutionMode;

/// Version of the bundle layout written by [`BundleCollector`].
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("failed to write evidence to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode evidence: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("collector output has no path= token: {0:?}")]
    NoPath(String),
}

/// Whether this run should capture evidence.
///
/// Errors always do. Warnings only when enabled for warnings, out of
/// cooldown and with a signal set not seen before.
pub fn should_collect(severity: Severity, fingerprint_changed: bool, cooldown_ok: bool, collect_on_warn: bool) -> bool {
    match severity {
        Severity::Error => true,
        Severity::Warning => collect_on_warn && cooldown_ok && fingerprint_changed,
        Severity::Success => false,
    }
}

/// Input handed to a collector.
#[derive(Debug, Clone)]
pub struct EvidenceRequest {
    pub mode: ExecutionMode,
    pub run_id: String,
    pub output_dir: PathBuf,
    /// Run state at the time of the decision (conditions, metrics, ...).
    pub context: Value,
}

#[async_trait]
pub trait EvidenceCollector: Send + Sync {
    /// Capture evidence and return where it was written.
    async fn collect(&self, request: &EvidenceRequest) -> Result<PathBuf, EvidenceError>;
}

/// Writes the run context as `evidence_<mode>_<run_id>.json`.
#[derive(Debug, Clone, Default)]
pub struct BundleCollector;

#[async_trait]
impl EvidenceCollector for BundleCollector {
    async fn collect(&self, request: &EvidenceRequest) -> Result<PathBuf, EvidenceError> {
        let dir = &request.output_dir;
        std::fs::create_dir_all(dir).map_err(|source| EvidenceError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("evidence_{}_{}.json", request.mode, request.run_id));
        let doc = json!({
            "meta": {
                "generated_at": Utc::now().to_rfc3339(),
                "run_id": request.run_id,
                "mode": request.mode,
                "source": "watcher",
                "schema_version": SCHEMA_VERSION,
            },
            "context": request.context,
        });
        let bytes = serde_json::to_vec_pretty(&doc)?;
        std::fs::write(&path, bytes).map_err(|source| EvidenceError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), "evidence bundle written");
        Ok(path)
    }
}

/// Per-run flags appended to the collector's arguments when none are
/// configured. `{run_id}`, `{out_dir}` and `{mode}` are substituted.
pub const DEFAULT_RUN_ARGS: [&str; 6] = [
    "--run-id",
    "{run_id}",
    "--out-dir",
    "{out_dir}",
    "--mode",
    "{mode}",
];

/// Delegates to an external collector program.
///
/// The program is called with the configured arguments followed by the
/// expanded run arguments and must print `path=<file>` on stdout.
pub struct CommandCollector {
    program: String,
    args: Vec<String>,
    run_args: Vec<String>,
    timeout: Duration,
}

impl CommandCollector {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            run_args: DEFAULT_RUN_ARGS.iter().map(|a| a.to_string()).collect(),
            timeout,
        }
    }

    /// Replace the per-run argument template.
    pub fn with_run_args(mut self, run_args: Vec<String>) -> Self {
        self.run_args = run_args;
        self
    }

    fn command_args(&self, request: &EvidenceRequest) -> Vec<String> {
        let out_dir = request.output_dir.display().to_string();
        let mode = request.mode.to_string();
        self.args
            .iter()
            .cloned()
            .chain(self.run_args.iter().map(|a| {
                a.replace("{run_id}", &request.run_id)
                    .replace("{out_dir}", &out_dir)
                    .replace("{mode}", &mode)
            }))
            .collect()
    }
}

#[async_trait]
impl EvidenceCollector for CommandCollector {
    async fn collect(&self, request: &EvidenceRequest) -> Result<PathBuf, EvidenceError> {
        let args = self.command_args(request);
        let stdout = process::run_command(&self.program, &args, None, self.timeout).await?;
        parse_path(&stdout).ok_or_else(|| EvidenceError::NoPath(stdout.trim().chars().take(200).collect()))
    }
}

/// Last `path=<...>` token in collector output.
fn parse_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .split_whitespace()
        .filter_map(|tok| tok.strip_prefix("path="))
        .filter(|p| !p.is_empty())
        .last()
        .map(PathBuf::from)
}

/// Collector for the configuration, `None` when evidence is disabled.
pub fn from_config(cfg: &EvidenceConfig) -> Option<Box<dyn EvidenceCollector>> {
    if !cfg.enabled {
        return None;
    }
    match &cfg.command {
        Some(cmd) => Some(Box::new(
            CommandCollector::new(cmd.clone(), cfg.args.clone(), Duration::from_secs(cfg.timeout_sec))
                .with_run_args(cfg.run_args.clone()),
        )),
        None => Some(Box::new(BundleCollector)),
    }
}
