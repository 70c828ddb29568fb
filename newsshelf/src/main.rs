/*
newsshelf - single-binary main.rs
This binary starts the Rocket HTTP server and runs the scheduled processing worker inside the same process.
*/

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use common::Config;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newsshelf::error::PipelineError;
use newsshelf::processing::ContentProcessor;
use newsshelf::schedule;
use newsshelf::server::{launch_rocket, AppState};

#[derive(Parser, Debug)]
#[command(name = "newsshelf", about = "Newsshelf server + processing worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable background worker (run server only)
    #[arg(long)]
    no_worker: bool,

    /// Run worker only (do not bind HTTP server)
    #[arg(long)]
    worker_only: bool,

    /// Run a single processing batch, print its report and exit
    #[arg(long)]
    once: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = load_config(args.config.as_deref()).await?;

    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let max_connections = config.database.max_connections.unwrap_or(5);
    let db_pool = common::init_db_pool(&db_path_abs, max_connections)
        .await
        .map_err(|e| {
            error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
            e
        })?;

    // `--once` needs the schema regardless of the admin setting.
    if args.once || config.admin.as_ref().and_then(|a| a.auto_migrate).unwrap_or(false) {
        info!("running DB migrations");
        common::run_migrations(&db_pool).await?;
    }

    let processor = match ContentProcessor::from_config(&config, db_pool.clone()) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) if args.no_worker => {
            warn!(error = %format!("{:#}", e), "processing unavailable, serving read API only");
            None
        }
        Err(e) => return Err(e.context("failed to configure processing pipeline")),
    };

    if args.once {
        let processor = processor.context("processing pipeline not configured")?;
        let report = processor.run_batch().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let shutdown_notify = Arc::new(Notify::new());

    if args.worker_only {
        let processor = processor.context("processing pipeline not configured")?;
        info!("Starting in worker-only mode");
        let worker = run_worker(processor, config.clone(), shutdown_notify.clone());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, notifying worker to shutdown");
                shutdown_notify.notify_waiters();
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            res = worker => {
                if let Err(e) = res {
                    error!(%e, "worker encountered an error");
                }
            }
        }
        info!("worker-only run finished");
        return Ok(());
    }

    let mut worker_handle = None;
    match (&processor, args.no_worker) {
        (Some(p), false) => {
            info!("Spawning background worker task");
            let w_processor = p.clone();
            let w_cfg = config.clone();
            let w_shutdown = shutdown_notify.clone();
            worker_handle = Some(tokio::spawn(async move {
                let res = run_worker(w_processor, w_cfg, w_shutdown).await;
                if let Err(e) = &res {
                    error!(%e, "background worker failed");
                }
                res
            }));
        }
        _ => info!("Background worker disabled"),
    }

    let state = app_state(db_pool, config, processor);
    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(state).await {
        error!(%e, "Rocket server failed");
    }

    info!("HTTP server stopped; notifying worker to shutdown");
    shutdown_notify.notify_waiters();

    if let Some(handle) = worker_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(Ok(()))) => info!("worker exited cleanly"),
            Ok(Ok(Err(e))) => error!(%e, "worker task returned an error"),
            Ok(Err(join_err)) => error!(%join_err, "worker task panicked"),
            Err(_) => info!("Timed out waiting for worker to exit; continuing shutdown"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Merge `config.default.toml` with `--config` (or `./config.toml` when present).
async fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = match explicit {
        Some(p) if !p.exists() => {
            error!(path = ?p, "specified config file not found");
            anyhow::bail!("Config file not found: {}", p.display());
        }
        Some(p) => Some(p.to_path_buf()),
        None => Some(PathBuf::from("config.toml")).filter(|p| p.exists()),
    };

    let config = Config::load_with_defaults(
        Some(default_path.as_path()).filter(|p| p.exists()),
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!(%e, "failed to load configuration");
        e
    })?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

fn app_state(db: SqlitePool, config: Config, processor: Option<Arc<ContentProcessor>>) -> AppState {
    AppState {
        started_at: Utc::now(),
        config: Some(Arc::new(config)),
        db,
        processor,
    }
}

/// Background worker: runs a batch at each configured wall-clock time until
/// `shutdown_notify` is signalled. Batch errors are logged and the schedule continues.
async fn run_worker(
    processor: Arc<ContentProcessor>,
    config: Config,
    shutdown_notify: Arc<Notify>,
) -> anyhow::Result<()> {
    let times = config.scheduler.parsed_times()?;
    info!("worker: initializing scheduler with times: {:?}", config.scheduler.times);

    if config.scheduler.run_on_start.unwrap_or(false) {
        run_scheduled_batch(&processor).await;
    }

    loop {
        let Some(delay) = schedule::delay_until_next(Utc::now(), &times) else {
            warn!("worker: no scheduler times configured, waiting for shutdown");
            shutdown_notify.notified().await;
            break;
        };
        info!(next_in_seconds = delay.as_secs(), "worker: sleeping until next run");

        select! {
            _ = tokio::time::sleep(delay) => run_scheduled_batch(&processor).await,
            _ = shutdown_notify.notified() => {
                info!("worker: shutdown requested, exiting loop");
                break;
            }
        }
    }

    info!("worker: cleanup complete");
    Ok(())
}

async fn run_scheduled_batch(processor: &ContentProcessor) {
    match processor.run_batch().await {
        Ok(report) => info!(
            run_id = %report.run_id,
            fetched = report.counts.fetched,
            persisted = report.counts.persisted,
            skipped = report.counts.skipped,
            failed = report.counts.failed,
            "worker: batch completed"
        ),
        Err(PipelineError::BatchInProgress) => warn!("worker: previous batch still running, skipping this slot"),
        Err(e) => error!(error = %e, "worker: batch failed"),
    }
}
