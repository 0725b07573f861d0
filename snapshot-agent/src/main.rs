//! Snapshot Agent - Main entry point
//!
//! Hosts the backup triggers: a periodic timer and a final cycle on shutdown.

use anyhow::Result;
use clap::Parser;
use snapshot_agent::daemon::{BackupScheduler, ShutdownCoordinator};
use snapshot_agent::executor::outcome::{FanoutSink, JsonLinesSink, OutcomeSink, TracingSink};
use snapshot_agent::{config::Config, utils, BackupOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single backup cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting snapshot-agent v{} (destination: {}, max backups: {}, {} source(s))",
        env!("CARGO_PKG_VERSION"),
        config.backup.destination_dir.display(),
        config.backup.max_backups,
        config.sources.len()
    );

    let orchestrator = BackupOrchestrator::new(&config.backup, config.sources.clone())
        .with_sink(outcome_sink(&config));
    let cycle_timeout = Duration::from_secs(config.schedule.cycle_timeout_secs);

    if args.once {
        return match orchestrator.run_cycle_with_timeout(cycle_timeout).await {
            Some(outcome) if outcome.is_success() => Ok(()),
            Some(_) => anyhow::bail!("backup cycle completed with errors"),
            None => anyhow::bail!("backup cycle did not finish within {:?}", cycle_timeout),
        };
    }

    let shutdown_coordinator = ShutdownCoordinator::new();

    let scheduler_handle = if config.schedule.interval_secs > 0 {
        let scheduler = BackupScheduler::new(
            orchestrator.clone(),
            Duration::from_secs(config.schedule.interval_secs),
            cycle_timeout,
        )
        .run_on_start(config.schedule.run_on_start);
        Some(tokio::spawn(scheduler.run(shutdown_coordinator.token())))
    } else {
        if config.schedule.run_on_start {
            orchestrator.run_cycle_with_timeout(cycle_timeout).await;
        }
        None
    };

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    // Let an in-flight scheduled cycle finish before the final one
    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            tracing::error!("Scheduler task panicked: {}", e);
        }
    }

    if config.schedule.run_on_shutdown {
        tracing::info!("Running final backup before exit");
        if orchestrator.run_cycle_with_timeout(cycle_timeout).await.is_none() {
            tracing::warn!("Final backup did not finish in time");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn outcome_sink(config: &Config) -> Arc<dyn OutcomeSink> {
    match &config.log.outcome_file {
        Some(path) => Arc::new(
            FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(Arc::new(JsonLinesSink::new(path))),
        ),
        None => Arc::new(TracingSink),
    }
}
