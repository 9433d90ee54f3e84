//! Syncpipe Server - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use syncpipe_common::logging::{init_logging, LogConfig};
use tokio::{signal, sync::watch};
use tracing::{info, warn};

use syncpipe_server::{
    api::{self, AppState},
    config::Config,
    sync::{
        cache::PgCache,
        checkpoint::PgCheckpointStore,
        history::{PgExecutionLog, PgJobStore},
        idempotency::PgIdempotencyGuard,
        sink::PgSink,
        JobsFile, Orchestrator, RunOutcome,
    },
};

#[derive(Parser, Debug)]
#[command(name = "syncpipe-server")]
#[command(author, version, about = "Incremental data synchronization service", long_about = None)]
struct Args {
    /// TOML file declaring `[[sources]]` and `[[jobs]]`
    #[arg(long, env = "SYNC_JOBS_FILE")]
    jobs_file: Option<PathBuf>,

    /// Run every enabled job once and exit
    #[arg(long)]
    once: bool,

    /// Keep checkpoints, history and committed batches in memory (no database)
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("syncpipe-server".to_string())
        .filter_directives("syncpipe_server=debug,tower_http=debug,sqlx=warn".to_string())
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting syncpipe server");

    let config = Config::load()?;
    let jobs_path = args
        .jobs_file
        .clone()
        .or_else(|| config.sync.jobs_file.clone())
        .context("No jobs file configured (use --jobs-file or SYNC_JOBS_FILE)")?;
    let jobs_file = JobsFile::load(&jobs_path)?;
    info!(
        path = %jobs_path.display(),
        sources = jobs_file.sources.len(),
        jobs = jobs_file.jobs.len(),
        "Jobs file loaded"
    );

    let builder = Orchestrator::builder(jobs_file.registry()?).settings(config.sync.clone());
    let builder = if args.in_memory {
        warn!("Running with in-memory stores; state is lost on exit");
        builder
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
            .connect(&config.database.url)
            .await?;
        info!("Database connection pool established");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
        info!("Database migrations completed");

        let job_store = PgJobStore::new(pool.clone());
        job_store.record_sources(&jobs_file.sources).await?;

        let idempotency_ttl = chrono::Duration::seconds(i64::try_from(config.sync.idempotency_ttl_secs)?);
        builder
            .checkpoints(Arc::new(PgCheckpointStore::new(pool.clone())))
            .idempotency_guard(Arc::new(PgIdempotencyGuard::new(pool.clone(), idempotency_ttl)))
            .cache(Arc::new(PgCache::new(pool.clone(), config.sync.cache_capacity)))
            .sink(Arc::new(PgSink::new(pool.clone())))
            .execution_log(Arc::new(PgExecutionLog::new(pool)))
            .job_store(Arc::new(job_store))
    };
    let orchestrator = Arc::new(builder.build());

    for job in jobs_file.to_jobs(&config.sync) {
        orchestrator.register(job).await?;
    }

    if args.once {
        return run_once(&orchestrator).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = if config.sync.enabled {
        Some(orchestrator.clone().start(wait_for(shutdown_rx.clone())))
    } else {
        info!("Scheduler disabled (SYNC_ENABLED=false); serving the ops API only");
        None
    };

    let app = api::create_router(AppState::new(orchestrator), &config.cors);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs, shutdown_tx))
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.await?;
    }
    info!("Server shut down gracefully");

    Ok(())
}

/// Run each enabled job once, in priority order, and report the outcomes
async fn run_once(orchestrator: &Arc<Orchestrator>) -> Result<()> {
    let mut jobs = orchestrator.jobs().await;
    jobs.retain(|j| j.enabled);
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    let mut failed = 0usize;
    for job in jobs {
        match orchestrator.run_now(job.id).await? {
            RunOutcome::Executed(execution) => {
                info!(
                    job = %job.name,
                    status = execution.status.as_str(),
                    rows_synced = execution.rows_synced,
                    rows_rejected = execution.rows_rejected,
                    "Run complete"
                );
                if execution.error_message.is_some() {
                    failed += 1;
                }
            },
            RunOutcome::Skipped { reason, .. } => info!(job = %job.name, ?reason, "Run skipped"),
        }
    }

    if failed > 0 {
        anyhow::bail!("{} job(s) failed", failed);
    }
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, then stop the scheduler
async fn shutdown_signal(timeout_secs: u64, scheduler: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    let _ = scheduler.send(true);

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
