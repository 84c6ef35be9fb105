//! Where snapshot payloads come from.

use std::time::Duration;

use tracing::debug;

use super::SnapshotError;
use crate::config::SnapshotConfig;
use crate::process;

/// Producer of the raw snapshot text.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Return the pipeline's textual output.
    async fn fetch(&self) -> Result<String, SnapshotError>;
}

/// Runs the configured pipeline command and returns its stdout.
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(cfg: &SnapshotConfig) -> Self {
        Self::new(
            cfg.command.clone(),
            cfg.args.clone(),
            Duration::from_secs(cfg.timeout_sec),
        )
    }
}

#[async_trait::async_trait]
impl SnapshotSource for CommandSource {
    async fn fetch(&self) -> Result<String, SnapshotError> {
        debug!(program = %self.program, args = ?self.args, "running snapshot command");
        let out = process::run_command(&self.program, &self.args, None, self.timeout).await?;
        Ok(out)
    }
}
