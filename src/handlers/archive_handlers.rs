//! HTTP handlers for archive and restore operations.
//! Each handler resolves the entity from the path and delegates the actual
//! orchestration to `ArchiveService`.

use crate::{
    errors::{AppError, ArchiveError},
    models::entity::{ArchiveRecord, EntityKind, EntityRef},
    services::ArchiveService,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

/// Plural collection segment in `/{kind}/{id}` routes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KindSegment {
    Reports,
    Analyses,
}

impl KindSegment {
    fn entity(self, id: i64) -> EntityRef {
        match self {
            KindSegment::Reports => EntityRef::report(id),
            KindSegment::Analyses => EntityRef::analysis(id),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArchiveResponse {
    pub kind: EntityKind,
    pub id: i64,
    pub archive_location: String,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub kind: EntityKind,
    pub id: i64,
    pub restored: bool,
}

/// `GET /{kind}/{id}`: current archive state of a report or analysis.
pub async fn get_record(
    State(service): State<ArchiveService>,
    Path((kind, id)): Path<(KindSegment, i64)>,
) -> Result<Json<ArchiveRecord>, AppError> {
    let entity = kind.entity(id);
    let record = service
        .catalog
        .fetch(entity)
        .await
        .map_err(ArchiveError::from)?
        .ok_or_else(|| AppError::not_found(format!("{entity} not found")))?;
    Ok(Json(record))
}

/// `POST /{kind}/{id}/archive`: archive, cascading to dependent analyses.
pub async fn archive_entity(
    State(service): State<ArchiveService>,
    Path((kind, id)): Path<(KindSegment, i64)>,
) -> Result<Json<ArchiveResponse>, AppError> {
    let entity = kind.entity(id);
    let locator = service.archive(entity).await?;
    Ok(Json(ArchiveResponse {
        kind: entity.kind,
        id,
        archive_location: locator.to_string(),
    }))
}

/// `POST /{kind}/{id}/restore`: restore, cascading to archived dependencies.
pub async fn restore_entity(
    State(service): State<ArchiveService>,
    Path((kind, id)): Path<(KindSegment, i64)>,
) -> Result<Json<RestoreResponse>, AppError> {
    let entity = kind.entity(id);
    service.restore(entity).await?;
    Ok(Json(RestoreResponse {
        kind: entity.kind,
        id,
        restored: true,
    }))
}
