use anyhow::{Context, Result};
use axum::Router;
use config::{AppConfig, Backend};
use services::{
    gateway::{
        BlobStore, RecordTable,
        aws::{self, DynamoRecordTable, S3BlobStore},
        local::{LocalBlobStore, SqliteRecordTable},
        memory::{MemoryBlobStore, MemoryRecordTable},
    },
    image_service::ImageService,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-service with config: {:?}", cfg);

    if migrate && cfg.backend != Backend::Local {
        anyhow::bail!("--migrate only applies to the local backend");
    }

    // --- Initialize storage gateways ---
    let (blobs, records): (Arc<dyn BlobStore>, Arc<dyn RecordTable>) = match cfg.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory storage; nothing survives a restart");
            (
                Arc::new(MemoryBlobStore::new(&cfg.bucket_name)),
                Arc::new(MemoryRecordTable::new()),
            )
        }
        Backend::Local => {
            let table = open_sqlite(&cfg).await?;
            let applied = table
                .migrate()
                .await
                .context("applying the SQLite schema")?;
            tracing::info!("Applied {} schema statements", applied);

            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }

            // --- Ensure storage directory exists ---
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }

            (
                Arc::new(LocalBlobStore::new(&cfg.storage_dir, &cfg.bucket_name)),
                Arc::new(table),
            )
        }
        Backend::Aws => {
            let sdk = aws::load_sdk_config(cfg.region.clone(), cfg.endpoint_url.clone()).await;
            // Emulators such as LocalStack only route path-style bucket URLs.
            let force_path_style = cfg.endpoint_url.is_some();
            tracing::info!(
                bucket = %cfg.bucket_name,
                table = %cfg.table_name,
                endpoint = ?cfg.endpoint_url,
                "Using AWS storage"
            );
            (
                Arc::new(S3BlobStore::from_sdk_config(
                    &sdk,
                    &cfg.bucket_name,
                    force_path_style,
                )),
                Arc::new(DynamoRecordTable::from_sdk_config(&sdk, &cfg.table_name)),
            )
        }
    };

    // --- Initialize core service ---
    let service = ImageService::new(blobs, records)
        .with_policy(cfg.image_policy())
        .with_identity(cfg.identity_policy())
        .with_url_ttl(cfg.url_ttl());

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.body_limit()).with_state(service);

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
    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the SQLite pool behind the local record table, creating the
/// database file and its parent directory when missing.
async fn open_sqlite(cfg: &AppConfig) -> Result<SqliteRecordTable> {
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);

    // Create parent directory if needed
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(SqliteRecordTable::new(Arc::new(db)))
}
