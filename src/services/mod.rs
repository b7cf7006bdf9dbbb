//! Archive/restore orchestration and the collaborators it drives.

pub mod archive;
pub mod catalog;
pub mod dump_engine;
pub mod object_store;
pub mod resolver;
pub mod restore;
pub mod temp_artifact;

#[cfg(test)]
pub mod test_support;

use crate::{
    errors::{AppError, ArchiveResult},
    models::{
        entity::{EntityKind, EntityRef},
        locator::Locator,
    },
    services::{
        archive::Archiver,
        catalog::CatalogStore,
        dump_engine::{DumpEngine, ObjectSelector},
        object_store::ObjectStore,
        restore::Restorer,
        temp_artifact::TempArtifacts,
    },
};
use std::{future::Future, sync::Arc, time::Duration};

/// Knobs shared by both orchestrators.
#[derive(Clone, Debug)]
pub struct ArchiveSettings {
    /// Object store container every dump is uploaded to.
    pub container: String,

    /// Table pattern owned by a report, with `{id}` substituted.
    pub report_tables: String,

    /// Table pattern owned by an analysis, with `{id}` substituted.
    pub analysis_tables: String,

    /// Maximum cascade siblings processed at once.
    pub cascade_concurrency: usize,
}

impl ArchiveSettings {
    pub fn selector(&self, entity: EntityRef) -> ObjectSelector {
        let template = match entity.kind {
            EntityKind::Report => &self.report_tables,
            EntityKind::Analysis => &self.analysis_tables,
        };
        ObjectSelector::from_template(template, entity.id)
    }

    pub fn concurrency(&self) -> usize {
        self.cascade_concurrency.max(1)
    }
}

/// Injected collaborators. Cheap to clone; everything is shared.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogStore>,
    pub dump: Arc<dyn DumpEngine>,
    pub objects: Arc<dyn ObjectStore>,
    pub temps: TempArtifacts,
    pub settings: Arc<ArchiveSettings>,
}

/// Entry point used by the HTTP layer: both orchestrators plus an optional
/// caller-level timeout around each operation.
#[derive(Clone)]
pub struct ArchiveService {
    pub archiver: Archiver,
    pub restorer: Restorer,
    pub catalog: Arc<dyn CatalogStore>,
    pub temps: TempArtifacts,
    pub operation_timeout: Option<Duration>,
}

impl ArchiveService {
    pub fn new(collaborators: Collaborators, operation_timeout: Option<Duration>) -> Self {
        Self {
            archiver: Archiver::new(collaborators.clone()),
            restorer: Restorer::new(collaborators.clone()),
            catalog: collaborators.catalog,
            temps: collaborators.temps,
            operation_timeout,
        }
    }

    pub async fn archive(&self, entity: EntityRef) -> Result<Locator, AppError> {
        self.bounded(entity, async {
            match entity.kind {
                EntityKind::Report => self.archiver.archive_report(entity.id).await,
                EntityKind::Analysis => self.archiver.archive_analysis(entity.id).await,
            }
        })
        .await
    }

    pub async fn restore(&self, entity: EntityRef) -> Result<(), AppError> {
        self.bounded(entity, async {
            match entity.kind {
                EntityKind::Report => self.restorer.restore_report(entity.id).await,
                EntityKind::Analysis => self.restorer.restore_analysis(entity.id).await,
            }
        })
        .await
    }

    /// Apply the configured timeout, if any. Dropping the operation on
    /// timeout removes its temp artifacts and kills its child processes.
    async fn bounded<T>(
        &self,
        entity: EntityRef,
        op: impl Future<Output = ArchiveResult<T>>,
    ) -> Result<T, AppError> {
        match self.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, op).await {
                Ok(result) => Ok(result?),
                Err(_) => {
                    tracing::warn!("{} operation timed out after {:?}", entity, limit);
                    Err(AppError::timeout(format!(
                        "{} operation timed out after {}s",
                        entity,
                        limit.as_secs()
                    )))
                }
            },
            None => Ok(op.await?),
        }
    }
}
