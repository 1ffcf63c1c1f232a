//! syn-worker - Background worker for scheduled dispatch
//!
//! Runs the recurring due-scan, drains the queue under the configured
//! concurrency bound, and dispatches content to platform adapters.

use clap::Parser;
use futures::future::join_all;
use libsyndicate::config::Config;
use libsyndicate::db::ContentStore;
use libsyndicate::dispatcher::Dispatcher;
use libsyndicate::notify::EventBus;
use libsyndicate::platforms::mock::MockAdapter;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::queue::Queue;
use libsyndicate::retry::RetryController;
use libsyndicate::scheduler::Scheduler;
use libsyndicate::types::JobKind;
use libsyndicate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "syn-worker")]
#[command(version)]
#[command(about = "Background worker for scheduled dispatch")]
#[command(long_about = "\
syn-worker - Background worker for scheduled dispatch

DESCRIPTION:
    syn-worker is a long-running daemon that drives the Syndicate queue.
    Each cycle it reclaims stalled leases, runs the due-scan that moves
    scheduled content into the queue, and dispatches publish and retry
    jobs to platform adapters under the configured concurrency bound.

USAGE:
    # Run in foreground (logs to stderr)
    syn-worker

    # Run with a custom poll interval
    syn-worker --poll-interval 30

    # Single pass, simulated adapters (for testing)
    syn-worker --once --dry-run

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight jobs)

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml
    Database location: ~/.local/share/syndicate/syndicate.db

    Override with environment variables:
        SYNDICATE_CONFIG      - Path to config file
        SYNDICATE_LOG_FORMAT  - text, json, or pretty
        SYNDICATE_LOG_LEVEL   - log filter (default: info)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to drain the queue (default: config scan interval)")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one pass and exit (for testing)
    #[arg(long, hide = true)]
    #[arg(help = "Run the scan and drain cycle once, then exit")]
    once: bool,

    /// Use simulated adapters that always succeed
    #[arg(long)]
    #[arg(help = "Register simulated adapters instead of real ones")]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("syn-worker failed: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let store = ContentStore::new(&config.database.path).await?;
    let queue = Queue::new(store.pool().clone(), config.queue.lease_timeout_secs);
    let bus = EventBus::default();

    let registry = build_registry(&config, cli.dry_run);
    if registry.is_empty() {
        warn!("no platform adapters registered; publish jobs will fail permanently");
    }

    let retry = RetryController::new(store.clone(), queue.clone(), config.clone(), bus.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        retry,
        bus,
        Duration::from_secs(config.dispatch.adapter_timeout_secs),
    );
    let scheduler = Scheduler::new(store.clone(), queue.clone());

    info!("syn-worker starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval = cli.poll_interval.unwrap_or(config.queue.scan_interval_secs);
    info!("Poll interval: {}s", poll_interval);

    if cli.once {
        // No ticker in single-pass mode; trigger the scan directly.
        queue.enqueue_recurring_tick(JobKind::RecurringScan).await?;
        run_pass(&queue, &scheduler, &dispatcher, &config).await?;
        info!("syn-worker: single pass complete, exiting");
        return Ok(());
    }

    // The ticker funnels the due-scan through the queue so a crashed scan
    // is retried like any other job.
    let ticker = queue.start_recurring(
        JobKind::RecurringScan,
        Duration::from_secs(config.queue.scan_interval_secs),
    );

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping worker loop");
            break;
        }

        if let Err(e) = run_pass(&queue, &scheduler, &dispatcher, &config).await {
            error!("worker pass failed: {}", e);
        }

        // Sleep until the next poll, checking for shutdown every second.
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    ticker.stop();
    info!("syn-worker stopped");
    Ok(())
}

/// One drain cycle: reclaim stalled leases, run due scans, dispatch
/// publish and retry jobs, sweep old finished entries.
async fn run_pass(
    queue: &Queue,
    scheduler: &Scheduler,
    dispatcher: &Dispatcher,
    config: &Config,
) -> Result<()> {
    queue.reap_stalled().await?;

    for job in queue.dequeue(JobKind::RecurringScan, 1).await? {
        match scheduler.scan_due().await {
            Ok(_) => queue.complete(&job.id).await?,
            Err(e) => queue.fail(&job.id, &e.to_string()).await?,
        }
    }

    drain(queue, dispatcher, JobKind::Publish, config.dispatch.workers).await?;
    drain(queue, dispatcher, JobKind::Retry, config.dispatch.workers).await?;

    let cutoff = chrono::Utc::now().timestamp() - config.queue.retention_secs as i64;
    queue.purge_finished(cutoff).await?;

    Ok(())
}

/// Dispatch ready jobs of one kind concurrently under the worker bound.
async fn drain(
    queue: &Queue,
    dispatcher: &Dispatcher,
    kind: JobKind,
    workers: usize,
) -> Result<()> {
    let jobs = queue.dequeue(kind, workers).await?;
    if jobs.is_empty() {
        return Ok(());
    }

    info!("dispatching {} {} job(s)", jobs.len(), kind);

    let outcomes = join_all(jobs.iter().map(|job| async {
        let result = dispatcher.process(job).await;
        (job.id.clone(), result)
    }))
    .await;

    for (job_id, result) in outcomes {
        match result {
            Ok(()) => queue.complete(&job_id).await?,
            Err(e) => {
                error!(job = %job_id, "job processing failed: {}", e);
                queue.fail(&job_id, &e.to_string()).await?;
            }
        }
    }

    Ok(())
}

/// Adapter registration happens once at process start. Real adapters live
/// outside this crate; configured platforms get simulated adapters so the
/// full dispatch path can run without credentials.
fn build_registry(config: &Config, dry_run: bool) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for platform in config.platforms.keys() {
        if !dry_run {
            warn!(platform = %platform, "using simulated adapter (no real adapter compiled in)");
        }
        registry.register(Arc::new(MockAdapter::succeeding(platform)));
    }
    registry
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) {
    use libsyndicate::logging::{LogFormat, LoggingConfig};

    let format = std::env::var("SYNDICATE_LOG_FORMAT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(LogFormat::Text);
    let level = std::env::var("SYNDICATE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, verbose).init();
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libsyndicate::SyndicateError::Validation(format!("Signal setup failed: {}", e))
    })?;

    let shutdown_clone = shutdown.clone();
    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown_clone.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}
