//! Server bootstrap: database, shared state, background sweep and listener.

use crate::{
    config::AppConfig,
    routes::routes::routes,
    services::{
        chunk_assembler::ChunkAssembler, file_service::FileService,
        metadata_store::MetadataStore, storage_gateway::LocalDiskGateway,
    },
};
use anyhow::{Context, Result};
use axum::Router;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener, task::JoinHandle};
use tower_http::trace::TraceLayer;

const MIGRATION_SQL: &str = include_str!("../migrations/0001_init.sql");

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
    pub uploads: ChunkAssembler,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wire the bundled local-disk provider and SQLite metadata together.
    pub fn new(config: AppConfig, db: Arc<SqlitePool>) -> Self {
        let gateway = Arc::new(LocalDiskGateway::new(&config.storage_dir, &config.folder));
        let files = FileService::new(gateway, MetadataStore::new(db), &config.public_url);
        let uploads = ChunkAssembler::new(&config.staging_dir);
        Self {
            files,
            uploads,
            config: Arc::new(config),
        }
    }
}

/// Open (creating if needed) the SQLite database at `url`.
pub async fn connect_db(url: &str, max_connections: u32) -> Result<Arc<SqlitePool>> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("parsing database url `{}`", url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to `{}`", url))?;
    Ok(Arc::new(pool))
}

/// Run the embedded SQLite migration. Statements are idempotent.
pub async fn run_migrations(db: &Arc<SqlitePool>) -> Result<()> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}

/// Router with shared state and request tracing attached.
pub fn app(state: AppState) -> Router {
    routes(state.config.max_request_bytes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the storage and staging directories, plus the parent directory
/// of a file-backed SQLite database.
pub async fn prepare_dirs(cfg: &AppConfig) -> Result<()> {
    for dir in [&cfg.storage_dir, &cfg.staging_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir).await?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if db_path.starts_with(':') {
        return Ok(());
    }
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}

/// Periodically finish pending deletes, drop orphans and expire idle
/// chunk sessions.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match state.files.reconcile(state.config.orphan_grace).await {
                Ok(report) => tracing::debug!(?report, "reconciliation pass finished"),
                Err(err) => tracing::warn!("reconciliation pass failed: {}", err),
            }
            match state.uploads.sweep_expired(state.config.session_ttl).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("expired {} stale upload session(s)", n),
                Err(err) => tracing::warn!("upload session sweep failed: {}", err),
            }
        }
    })
}

/// Bind the listener, falling back to loopback when a wildcard bind is denied.
pub async fn bind(cfg: &AppConfig) -> Result<TcpListener> {
    let addr = cfg.addr();
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
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
            Ok(TcpListener::bind(&fallback_addr).await?)
        }
        Err(err) => Err(err.into()),
    }
}

/// Run the server until Ctrl-C.
pub async fn serve(cfg: AppConfig, migrate_only: bool) -> Result<()> {
    tracing::info!("Starting temp-file-host with config: {:?}", cfg);

    prepare_dirs(&cfg).await?;
    let db = connect_db(&cfg.database_url, 5).await?;
    run_migrations(&db).await?;
    if migrate_only {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let listener = bind(&cfg).await?;
    let state = AppState::new(cfg, db);
    let sweeper = spawn_sweeper(state.clone());

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    sweeper.abort();
    Ok(())
}
