use anyhow::{Context, Result};
use axum::Router;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod queue;
mod repository;
mod routes;
mod services;
mod storage;
#[cfg(test)]
mod testing;
mod thumbnails;

use config::{AppConfig, RunMode};
use repository::sqlite::SqliteFileRepository;
use services::{access::AccessResolver, file_service::FileService};
use thumbnails::ThumbnailWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-ingest ({:?}) with config: {:?}", mode, cfg);

    match mode {
        RunMode::Migrate { grants } => {
            let repo = SqliteFileRepository::new(connect_db(&cfg.database_url).await?);
            repo.migrate().await?;
            for rule in &grants {
                repo.add_access_rule(rule).await?;
                tracing::info!(%rule, "Access rule installed");
            }
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::Worker => run_worker(&cfg).await,
        RunMode::Serve { embedded_worker } => serve(&cfg, embedded_worker).await,
    }
}

/// Open the SQLite pool, creating the database file's directory if needed.
async fn connect_db(db_url: &str) -> Result<Arc<SqlitePool>> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !db_path.is_empty() && !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {:?}", parent))?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = db_url
        .parse::<sqlx::sqlite::SqliteConnectOptions>()
        .with_context(|| format!("invalid database url `{}`", db_url))?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to the metadata database")?;
    Ok(Arc::new(pool))
}

/// Standalone consumer process.
async fn run_worker(cfg: &AppConfig) -> Result<()> {
    let blobs = storage::build_blob_store(cfg).await?;
    let queue = queue::build_queue(&cfg.queue)?;
    let worker = ThumbnailWorker::new(blobs, queue, cfg.queue.thumbnail_queue.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    worker.run(shutdown).await
}

async fn serve(cfg: &AppConfig, embedded_worker: bool) -> Result<()> {
    // --- Initialize stores and the shared queue handle ---
    let repo = Arc::new(SqliteFileRepository::new(connect_db(&cfg.database_url).await?));
    let blobs = storage::build_blob_store(cfg).await?;
    let queue = queue::build_queue(&cfg.queue)?;

    let shutdown = CancellationToken::new();
    let worker_task = if embedded_worker {
        let worker = ThumbnailWorker::new(
            blobs.clone(),
            queue.clone(),
            cfg.queue.thumbnail_queue.clone(),
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { worker.run(token).await }))
    } else {
        None
    };

    // --- Initialize core service ---
    let service = FileService::new(
        repo,
        blobs,
        queue,
        cfg.upload.clone(),
        AccessResolver::new(cfg.admin_role.clone()),
        cfg.queue.thumbnail_queue.clone(),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.upload.max_size_bytes).with_state(service);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel_on_signal(shutdown.clone()))
        .await?;

    // Stop the embedded worker after in-flight requests have drained.
    shutdown.cancel();
    if let Some(task) = worker_task {
        match task.await {
            Ok(result) => result?,
            Err(err) => tracing::error!(error = %err, "thumbnail worker task failed"),
        }
    }
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, then cancel `token`.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
        () = token.cancelled() => {}
    }
    token.cancel();
}
