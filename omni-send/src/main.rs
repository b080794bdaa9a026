//! omni-send - Dispatcher daemon
//!
//! Runs the scheduler sweep and the publish and media worker pools against
//! the task store until it is told to stop.

use anyhow::{Context, Result};
use clap::Parser;
use libomnicast::events::SideEffects;
use libomnicast::logging::{LogFormat, LogSettings};
use libomnicast::{Config, OmnicastError, PublishingService};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "omni-send")]
#[command(version)]
#[command(about = "Dispatcher daemon for scheduled publish tasks")]
#[command(long_about = "\
omni-send - Dispatcher daemon for scheduled publish tasks

DESCRIPTION:
    omni-send is the long-running half of Omnicast. Every scheduler interval
    it moves tasks that are due soon onto the publish queue, and its worker
    pools publish them: one pool runs publish attempts, the other polls
    destinations that process media asynchronously.

    Jobs left running by a crashed process are returned to the queue on
    startup and on every sweep.

USAGE:
    # Run in foreground (logs to stderr)
    omni-send

    # Sweep once, publish everything due, then exit
    omni-send --once

    # JSON logs for a log collector
    omni-send --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (stop claiming, finish running jobs)

CONFIGURATION:
    Configuration file: ~/.config/omnicast/config.toml (or OMNICAST_CONFIG)

    [scheduler]
    interval_secs = 60             # seconds between sweeps
    window_secs = 120              # how far ahead a sweep looks

    [queue]
    concurrency = 3                # publish jobs running at once
    max_attempts = 3               # attempts before a task fails

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "OMNICAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Worker concurrency (overrides config)
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Log output format: text, json or pretty (overrides OMNICAST_LOG_FORMAT)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one sweep, process every due job, and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LogSettings::from_env().verbose(cli.verbose);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    logging.init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "omni-send failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<OmnicastError>() {
        Some(OmnicastError::Config(_)) => 2,
        Some(e) => e.exit_code(),
        None => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    if let Some(concurrency) = cli.concurrency {
        config.queue.concurrency = concurrency.max(1);
    }
    let points_per_publish = config.rewards.points_per_publish;

    let service = PublishingService::from_config(config)
        .await
        .context("starting publishing service")?;

    info!(destinations = ?service.publishers().destinations(), "omni-send starting");
    if service.publishers().is_empty() {
        warn!("No destinations configured; tasks will fail until one is added");
    }

    let side_effects = SideEffects::new(service.db().clone(), points_per_publish).spawn(service.events());
    let scheduler = service.scheduler();

    if cli.once {
        let report = scheduler.sweep().await?;
        let processed = drain(&service).await?;
        info!(found = report.found, processed, "omni-send: processed due jobs once, exiting");
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone())?;

        let (_, publish, media, updates) = tokio::join!(
            scheduler.run(shutdown.clone()),
            service.publish_workers().run(shutdown.clone()),
            service.media_workers().run(shutdown.clone()),
            service.update_workers().run(shutdown.clone()),
        );
        publish.context("publish workers")?;
        media.context("media workers")?;
        updates.context("update workers")?;
    }

    // Dropping the service closes the event bus once queued side effects ran
    drop(scheduler);
    drop(service);
    if tokio::time::timeout(Duration::from_secs(5), side_effects).await.is_err() {
        warn!("Side effects still running at shutdown");
    }

    info!("omni-send stopped");
    Ok(())
}

/// Run every queue until nothing is due
async fn drain(service: &PublishingService) -> Result<usize> {
    let publish = service.publish_workers();
    let media = service.media_workers();
    let updates = service.update_workers();
    let mut total = 0;
    loop {
        let processed = publish.drain().await? + media.drain().await? + updates.drain().await?;
        if processed == 0 {
            return Ok(total);
        }
        total += processed;
    }
}

/// Set the shutdown flag on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    let handle = signals.handle();

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
        handle.close();
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
