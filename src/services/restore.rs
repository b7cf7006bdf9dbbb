//! src/services/restore.rs
//!
//! Drives reports and analyses from "archived" back to "present". An analysis
//! is only restored after every archived report it references is back.

use crate::{
    errors::{ArchiveError, ArchiveResult, Stage, StageExt},
    models::{
        entity::{ArchiveRecord, EntityRef},
        locator::Locator,
    },
    services::{Collaborators, resolver::DependencyResolver},
};
use futures::{TryStreamExt, stream};
use tracing::info;

#[derive(Clone)]
pub struct Restorer {
    ctx: Collaborators,
    resolver: DependencyResolver,
}

impl Restorer {
    pub fn new(ctx: Collaborators) -> Self {
        let resolver = DependencyResolver::new(ctx.catalog.clone());
        Self { ctx, resolver }
    }

    /// Restore a single report. Reports have no dependencies of their own.
    pub async fn restore_report(&self, id: i64) -> ArchiveResult<()> {
        let report = EntityRef::report(id);
        let record = self.ensure_archived(report).await?;
        self.restore_entity(report, record).await
    }

    /// Restore an analysis, restoring its archived reports first.
    pub async fn restore_analysis(&self, id: i64) -> ArchiveResult<()> {
        let analysis = EntityRef::analysis(id);
        let record = self.ensure_archived(analysis).await?;

        let needed = self
            .resolver
            .needed_reports(id)
            .await
            .at(analysis, Stage::Resolve)?;
        if !needed.is_empty() {
            info!(
                "{} needs {} archived reports restored first: {:?}",
                analysis,
                needed.len(),
                needed
            );
            stream::iter(
                needed
                    .into_iter()
                    .map(|report_id| Ok::<_, ArchiveError>(self.restore_report(report_id))),
            )
            .try_buffer_unordered(self.ctx.settings.concurrency())
            .try_collect::<Vec<()>>()
            .await
            .at(analysis, Stage::Cascade)?;
        }

        self.restore_entity(analysis, record).await
    }

    /// Download, apply and un-archive one entity. The row is only updated
    /// once the dump has been applied; any earlier failure leaves it archived.
    async fn restore_entity(&self, entity: EntityRef, record: ArchiveRecord) -> ArchiveResult<()> {
        let raw = record
            .archive_location
            .ok_or(ArchiveError::NotArchivedOrDoesNotExist { entity })?;
        let location = raw.as_str();

        self.ctx
            .temps
            .with_temp_artifact(|path| async move {
                let locator = Locator::parse(location).at(entity, Stage::Download)?;
                self.ctx
                    .objects
                    .download(&locator, &path)
                    .await
                    .at(entity, Stage::Download)?;
                self.ctx
                    .dump
                    .restore(&path)
                    .await
                    .at(entity, Stage::Restore)?;
                Ok::<_, ArchiveError>(())
            })
            .await?;

        self.ctx
            .catalog
            .mark_restored(entity)
            .await
            .at(entity, Stage::Commit)?;

        info!("restored {} from {}", entity, raw);
        Ok(())
    }

    async fn ensure_archived(&self, entity: EntityRef) -> ArchiveResult<ArchiveRecord> {
        self.ctx
            .catalog
            .find_archived(entity)
            .await
            .at(entity, Stage::Validate)?
            .ok_or(ArchiveError::NotArchivedOrDoesNotExist { entity })
    }
}
