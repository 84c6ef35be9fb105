use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use kpiwatch::config::{LoggingConfig, WatchConfig};
use kpiwatch::dedup::FingerprintStore;
use kpiwatch::status::StatusPublisher;
use kpiwatch::storage::HistoryStore;
use kpiwatch::watcher::{RunOutcome, Watcher};
use kpiwatch::ExecutionMode;

#[derive(Parser)]
#[command(
    name = "kpiwatch",
    about = "KPI watcher: freshness, thresholds, baselines and deduplicated alerts",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (falls back to KPIWATCH_CONFIG, then /etc/kpiwatch/kpiwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one watcher pass
    Run {
        /// Execution mode; fingerprints are kept per mode
        #[arg(long, value_enum, default_value_t = ExecutionMode::Prod)]
        mode: ExecutionMode,
    },

    /// Show the last published status
    Status {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show recent alert records, newest first
    History {
        /// Number of records
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the last notified fingerprint
    Fingerprint {
        #[arg(long, value_enum, default_value_t = ExecutionMode::Prod)]
        mode: ExecutionMode,
    },

    /// Serve the read-only status API
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = WatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Run { mode } => {
            tracing::debug!(%mode, state_dir = %cfg.paths.state_dir.display(), "starting watcher run");
            let outcome = Watcher::from_config(cfg, mode).run().await?;
            if let RunOutcome::Completed {
                run_id,
                severity,
                notified,
                evidence,
            } = &outcome
            {
                let evidence = evidence
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{} run_id={} notified={} evidence={}",
                    severity, run_id, notified, evidence
                );
            }
            let code = outcome.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { json } => {
            let publisher = StatusPublisher::new(cfg.paths.status_path());
            match publisher.load()? {
                None => println!("No status published yet."),
                Some(doc) if json => println!("{}", serde_json::to_string_pretty(&doc)?),
                Some(doc) => {
                    println!("\n=== kpiwatch status ===");
                    println!("Severity:   {}", doc.severity);
                    println!("Run:        {} ({})", doc.run_id, doc.mode);
                    println!("Generated:  {}", doc.generated_at.to_rfc3339());
                    println!("Notified:   {}", doc.notified);
                    println!(
                        "Metrics:    total_jobs={} stuck={} timeout_rate={:.4} cancel_rate={:.4}",
                        doc.metrics.total_jobs,
                        doc.metrics.stuck,
                        doc.metrics.timeout_rate,
                        doc.metrics.cancel_rate
                    );
                    println!("\nFreshness:");
                    for (name, age) in &doc.freshness {
                        match age {
                            Some(h) => println!(" - {:<20} {:.1}h", name, h),
                            None => println!(" - {:<20} missing", name),
                        }
                    }
                    println!("\nConditions:");
                    if doc.conditions.is_empty() {
                        println!(" (none)");
                    }
                    for c in &doc.conditions {
                        println!(" - {}", c);
                    }
                    if let Some(path) = &doc.evidence {
                        println!("\nEvidence:   {}", path);
                    }
                    println!();
                }
            }
        }
        Commands::History { limit } => {
            let records = HistoryStore::new(cfg.paths.history_path()).recent(limit)?;
            if records.is_empty() {
                println!("No history yet.");
            } else {
                println!(
                    "{:<25} | {:<7} | {:<8} | {:>10} | {:>5} | Conditions",
                    "Timestamp", "Mode", "Severity", "Total jobs", "Stuck"
                );
                println!("{:-<25}-|-{:-<7}-|-{:-<8}-|-{:-<10}-|-{:-<5}-|-{:-<30}", "", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<25} | {:<7} | {:<8} | {:>10} | {:>5} | {}",
                        r.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                        r.mode,
                        r.severity,
                        r.total_jobs,
                        r.stuck,
                        r.conditions.len()
                    );
                }
            }
        }
        Commands::Fingerprint { mode } => {
            let store = FingerprintStore::new(cfg.paths.fingerprint_path(mode));
            match store.load() {
                Some(rec) => println!("{} {} {}", mode, rec.fingerprint, rec.timestamp.to_rfc3339()),
                None => println!("No fingerprint recorded for mode '{}'.", mode),
            }
        }
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting kpiwatch status API");
            kpiwatch::serve(&bind, cfg).await?;
        }
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}
