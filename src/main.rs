//! uptrail command line entry point.

use uptrail::config::Config;
use uptrail::history::SqliteStore;
use uptrail::probe::Checker;
use uptrail::runner::{Delivery, Monitor};

use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Probe all targets and notify about failures
    Regular,
    /// Send the digest of the last window's failures
    Resume,
}

#[derive(Debug, Parser)]
#[command(name = "uptrail", version, about = "Probe endpoints and report failures")]
struct Cli {
    /// Run mode
    #[arg(long = "type", value_enum)]
    mode: Mode,

    /// Configuration file
    #[arg(long, env = "UPTRAIL_CONFIG", default_value = "uptrail.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("uptrail=info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("uptrail: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cfg = Config::load(&cli.config)?;
    tracing::info!("Loaded {} target entries from {}", cfg.targets.len(), cli.config.display());
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    let (registry, rejected) = cfg.build_registry();
    for r in &rejected {
        tracing::warn!("Skipping {}", r);
    }

    let monitor = Monitor::new(
        cfg.run_settings(),
        store,
        Arc::new(Checker::new()?),
        cfg.build_notifier()?,
    );

    let delivery = match cli.mode {
        Mode::Regular => monitor.run_regular(&registry, rejected).await?.delivery,
        Mode::Resume => monitor.run_resume(&registry, Utc::now()).await?.delivery,
    };

    // Delivery problems are logged but do not fail a run that recorded its results.
    if let Delivery::Failed { error } = delivery {
        tracing::warn!("Run completed but notification failed: {}", error);
    }

    Ok(())
}
