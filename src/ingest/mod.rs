// Ingest service for SalesControl
// HTTP surface for recorder uploads, admin device management, internal chunk
// fetch and health, plus the orphan-file sweep.

pub mod auth;
pub mod routes;
pub mod storage;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IngestConfig;
use crate::database::Database;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<IngestConfig>,
}

/// How often the orphan sweep runs, and how old a file must be before it is
/// considered abandoned.
const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const ORPHAN_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Run the ingest service until SIGTERM/SIGINT, draining open requests.
pub async fn run(config: IngestConfig) -> Result<()> {
    let db = Database::connect(&config.database_url).await?;

    // Migrations are owned by the ingest service; the worker assumes the
    // schema is already in place.
    crate::database::migrations::run_migrations(db.pool()).await?;

    tokio::fs::create_dir_all(&config.audio_storage_dir)
        .await
        .context("Failed to create audio storage directory")?;

    let state = AppState {
        db: db.clone(),
        config: Arc::new(config),
    };

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match storage::sweep_orphans(
                &sweep_state.config.audio_storage_dir,
                &sweep_state.db,
                ORPHAN_MAX_AGE,
            )
            .await
            {
                Ok(0) => {}
                Ok(removed) => log::info!("Orphan sweep removed {} file(s)", removed),
                Err(e) => log::warn!("Orphan sweep failed: {:#}", e),
            }
        }
    });

    let app = routes::build_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    log::info!("Ingest service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::shutdown::shutdown_signal())
        .await
        .context("Ingest server error")?;

    log::info!("Ingest service stopped");
    Ok(())
}
