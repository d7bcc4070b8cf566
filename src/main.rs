use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, Broker};
use services::{
    credentials,
    dispatcher::{Dispatcher, QueueDispatcher, WorkerPool},
    downloader::{DownloadSettings, Downloader},
    pipeline::Pipeline,
    remote::{RemoteConnector, SftpConnector},
    scanner::{ScanSettings, Scanner},
    scheduler::Scheduler,
    state_store::StateStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting sftp-harvester with config: {:?}", cfg);

    // --- Ensure staging directory exists ---
    if !cfg.staging_dir.exists() {
        std::fs::create_dir_all(&cfg.staging_dir)?;
        tracing::info!("Created staging directory at {}", cfg.staging_dir.display());
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, cfg.db_pool_size).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if mode.migrate_only {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Wire the pipeline ---
    let store = StateStore::new(db.clone());
    let shutdown = CancellationToken::new();

    let (dispatcher, jobs) = match cfg.broker {
        Broker::Memory => QueueDispatcher::channel(),
    };
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);
    let credentials = credentials::from_source(&cfg.credential_source);
    let connector: Arc<dyn RemoteConnector> = Arc::new(SftpConnector::new(cfg.remote_timeout));

    let scanner = Scanner::new(
        store.clone(),
        credentials.clone(),
        connector.clone(),
        dispatcher.clone(),
        ScanSettings {
            remote_root: cfg.remote_root.clone(),
            dedup_key: cfg.dedup_key,
            remote_timeout: cfg.remote_timeout,
        },
    );
    let downloader = Downloader::new(
        store.clone(),
        credentials,
        connector,
        DownloadSettings {
            staging_dir: cfg.staging_dir.clone(),
            remote_timeout: cfg.remote_timeout,
            transfer_timeout: cfg.transfer_timeout,
        },
    );
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        scanner,
        downloader,
        dispatcher.clone(),
    ));
    let workers = WorkerPool::spawn(jobs, pipeline, cfg.workers, shutdown.clone());
    tracing::info!(workers = cfg.workers, "worker pool started");

    let scheduler = if mode.scheduler {
        let scheduler = Scheduler::new(dispatcher.clone(), cfg.scan_interval);
        Some(tokio::spawn(scheduler.run(shutdown.clone())))
    } else {
        tracing::info!("Periodic scans disabled; waiting for HTTP triggers");
        None
    };

    // --- Build router ---
    let state = handlers::AppState {
        store,
        dispatcher,
        staging_dir: cfg.staging_dir.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
            }
            tracing::info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await?;

    // --- Drain background tasks ---
    shutdown.cancel();
    if let Some(handle) = scheduler {
        if let Err(err) = handle.await {
            tracing::error!("Scheduler task ended abnormally: {}", err);
        }
    }
    workers.join().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
