//! Best-effort notification channels.
//!
//! A notifier never fails the run: each implementation logs and swallows its
//! own errors, and the watcher never looks at the outcome.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::config::NotifyConfig;
use crate::detect::Severity;
use crate::process;
use crate::storage::AlertRecord;
use crate::ExecutionMode;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str);
}

/// `[kpiwatch][PROD] WARNING 2 condition(s)`
pub fn subject(mode: ExecutionMode, severity: Severity, conditions: usize) -> String {
    format!(
        "[kpiwatch][{}] {} {} condition(s)",
        mode.to_string().to_uppercase(),
        severity,
        conditions
    )
}

/// Plain-text body describing one run.
pub fn body(record: &AlertRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("run_id: {}\n", record.run_id));
    out.push_str(&format!("mode: {}\n", record.mode));
    out.push_str(&format!("severity: {}\n", record.severity));
    out.push_str(&format!("timestamp: {}\n", record.timestamp.to_rfc3339()));
    match record.snapshot_ts {
        Some(ts) => out.push_str(&format!(
            "snapshot: {} window={}h total_jobs={} stuck={} timeout_rate={:.4} cancel_rate={:.4}\n",
            ts.to_rfc3339(),
            record.window_hours,
            record.total_jobs,
            record.stuck,
            record.timeout_rate,
            record.cancel_rate
        )),
        None => out.push_str("snapshot: none\n"),
    }
    if record.conditions.is_empty() {
        out.push_str("conditions: none\n");
    } else {
        out.push_str("conditions:\n");
        for c in &record.conditions {
            out.push_str(&format!("  - {}\n", c));
        }
    }
    if let Some(path) = &record.evidence {
        out.push_str(&format!("evidence: {}\n", path));
    }
    if let Some(msg) = &record.fatal {
        out.push_str(&format!("fatal: {}\n", msg));
    }
    out
}

/// Writes the notification to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) {
        warn!(%subject, %body, "[NOTIFY]");
    }
}

/// POSTs `{subject, body}` as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build webhook client, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, body: &str) {
        let payload = serde_json::json!({ "subject": subject, "body": body });
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url = %self.url, status = %resp.status(), "webhook notification sent");
            }
            Ok(resp) => {
                error!(url = %self.url, status = %resp.status(), "webhook rejected notification");
            }
            Err(e) => {
                error!(url = %self.url, error = %e, "webhook notification failed");
            }
        }
    }
}

/// Spawns a program with the body on stdin. `{subject}` in any argument is
/// replaced with the subject line.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, subject: &str, body: &str) {
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{subject}", subject)).collect();
        match process::run_command(&self.program, &args, Some(body.as_bytes()), self.timeout).await {
            Ok(_) => info!(program = %self.program, "command notification sent"),
            Err(e) => error!(program = %self.program, error = %e, "command notification failed"),
        }
    }
}

/// Fans a notification out to every configured channel, in order.
#[derive(Default)]
pub struct MultiNotifier {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<N: Notifier + 'static>(mut self, notifier: N) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Build the channel set from configuration.
    pub fn from_config(cfg: &NotifyConfig) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_sec);
        let mut multi = Self::new();
        if cfg.log {
            multi = multi.with(LogNotifier);
        }
        if let Some(url) = &cfg.webhook_url {
            multi = multi.with(WebhookNotifier::new(url.clone(), timeout));
        }
        if let Some(cmd) = &cfg.command {
            multi = multi.with(CommandNotifier::new(cmd.clone(), cfg.args.clone(), timeout));
        }
        multi
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn send(&self, subject: &str, body: &str) {
        for n in &self.notifiers {
            n.send(subject, body).await;
        }
    }
}
