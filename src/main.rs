use anyhow::Result;
use axum::Router;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    ArchiveService, ArchiveSettings, Collaborators, catalog::PgCatalog,
    dump_engine::PgDumpEngine, object_store::LocalObjectStore, temp_artifact::TempArtifacts,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting cold-archive with config: {:?}", cfg);

    // --- Ensure storage and staging directories exist ---
    for dir in [&cfg.storage_dir, &cfg.temp_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize PostgreSQL pool shared by every orchestration ---
    let db: PgPool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await?;

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Wire collaborators ---
    let collaborators = Collaborators {
        catalog: Arc::new(PgCatalog::new(db.clone())),
        dump: Arc::new(PgDumpEngine::new(
            cfg.database_url.clone(),
            cfg.pg_dump.clone(),
            cfg.pg_restore.clone(),
        )),
        objects: Arc::new(LocalObjectStore::new(cfg.storage_dir.clone())),
        temps: TempArtifacts::new(cfg.temp_dir.clone()),
        settings: Arc::new(ArchiveSettings {
            container: cfg.container.clone(),
            report_tables: cfg.report_tables.clone(),
            analysis_tables: cfg.analysis_tables.clone(),
            cascade_concurrency: cfg.cascade_concurrency,
        }),
    };
    let service = ArchiveService::new(collaborators, cfg.operation_timeout);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

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

/// Apply the catalog schema from the bundled SQL file.
async fn run_migrations(db: &PgPool) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}
