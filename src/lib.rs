//! kpiwatch -- KPI watcher and alerting engine.
//!
//! This crate provides the core library for periodic health checks over a
//! business pipeline's metric snapshots: freshness probing, tiered thresholds,
//! historical baselines, alert deduplication, evidence capture and a small
//! read-only status API.

pub mod api;
pub mod config;
pub mod dedup;
pub mod detect;
pub mod evidence;
pub mod guard;
pub mod notify;
pub mod process;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod watcher;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which deployment a run belongs to. Fingerprints are kept per mode so a test
/// run never suppresses a production alert.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Prod,
    Test,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Prod => write!(f, "prod"),
            ExecutionMode::Test => write!(f, "test"),
        }
    }
}

/// Round half away from zero to `places` decimals.
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Start the status API over the configured state directory.
pub async fn serve(bind: &str, config: config::WatchConfig) -> Result<()> {
    let addr: std::net::SocketAddr = bind.parse()?;
    let state = api::state::AppState::from_config(&config);
    let app = api::router(state);

    tracing::info!(%addr, state_dir = %config.paths.state_dir.display(), "kpiwatch API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
