//! Defines routes for archive and restore operations.
//!
//! ## Structure
//! - **Health endpoints**
//!   - `GET  /healthz`: liveness
//!   - `GET  /readyz` : readiness (database + temp dir)
//!
//! - **Entity endpoints** (`{kind}` is `reports` or `analyses`)
//!   - `GET  /{kind}/{id}`        : current archive state
//!   - `POST /{kind}/{id}/archive`: archive, cascading to dependent analyses
//!   - `POST /{kind}/{id}/restore`: restore, cascading to archived reports

use crate::{
    handlers::{
        archive_handlers::{archive_entity, get_record, restore_entity},
        health_handlers::{healthz, readyz},
    },
    services::ArchiveService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all archive routes.
///
/// The router carries shared state (`ArchiveService`) to all handlers.
pub fn routes() -> Router<ArchiveService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Entity routes
        .route("/{kind}/{id}", get(get_record))
        .route("/{kind}/{id}/archive", post(archive_entity))
        .route("/{kind}/{id}/restore", post(restore_entity))
}
