//! src/services/archive.rs
//!
//! Drives reports and analyses from "present" to "archived".
//!
//! Archiving a report first archives every present analysis that references
//! it; their drop statements are folded into the report's own transaction so
//! the report's tables and everything depending on them disappear together.
//! Analyses stranded by an earlier failed attempt (archived, tables still in
//! place) have their drop statements re-derived from their stored dump and
//! folded into the same transaction.

use crate::{
    errors::{ArchiveError, ArchiveResult, Stage, StageExt},
    models::{entity::EntityRef, locator::Locator},
    services::{Collaborators, resolver::DependencyResolver},
};
use futures::{TryStreamExt, stream};
use std::{collections::BTreeSet, path::Path};
use tracing::{info, warn};

/// A dumped and uploaded entity whose tables have not been dropped yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedArchive {
    pub entity: EntityRef,
    pub locator: Locator,

    /// Statements that drop the entity's tables. Executing them is the
    /// caller's job.
    pub cleanup: Vec<String>,
}

#[derive(Clone)]
pub struct Archiver {
    ctx: Collaborators,
    resolver: DependencyResolver,
}

impl Archiver {
    pub fn new(ctx: Collaborators) -> Self {
        let resolver = DependencyResolver::new(ctx.catalog.clone());
        Self { ctx, resolver }
    }

    /// Archive a report, cascading to its present dependent analyses first.
    ///
    /// Returns the locator recorded as the report's `archive_location`.
    pub async fn archive_report(&self, id: i64) -> ArchiveResult<Locator> {
        let report = EntityRef::report(id);
        self.ensure_present(report).await?;

        let dependents = self
            .resolver
            .dependent_analyses(id)
            .await
            .at(report, Stage::Resolve)?;
        if !dependents.is_empty() {
            info!(
                "{} cascades to {} analyses: {:?}",
                report,
                dependents.len(),
                dependents
            );
        }
        let stranded = self
            .resolver
            .stranded_analyses(id, &self.ctx.settings)
            .await
            .at(report, Stage::Resolve)?;
        if !stranded.is_empty() {
            warn!(
                "{} has {} archived analyses whose tables were never dropped: {:?}",
                report,
                stranded.len(),
                stranded
            );
        }
        let reclaimed = self
            .reclaim_analyses(stranded)
            .await
            .at(report, Stage::Reclaim)?;

        let cascaded = match self.cascade_analyses(dependents).await {
            Ok(cascaded) => cascaded,
            Err(err) => {
                warn!(
                    "cascade for {} aborted; analyses prepared before the failure keep \
                     their tables until {} is archived again: {}",
                    report, report, err
                );
                return Err(err).at(report, Stage::Cascade);
            }
        };

        let mut cleanup: Vec<String> = reclaimed
            .iter()
            .chain(&cascaded)
            .flat_map(|prepared| prepared.cleanup.iter().cloned())
            .collect();

        let locator = self
            .ctx
            .temps
            .with_temp_artifact(|path| async move {
                let prepared = self.dump_and_upload(report, &path).await?;
                cleanup.extend(prepared.cleanup);

                if let Err(err) = self
                    .ctx
                    .catalog
                    .commit_archive(report, &prepared.locator, &cleanup)
                    .await
                {
                    let err = ArchiveError::from(err);
                    warn_orphaned(report, &prepared.locator, &err);
                    return Err(err).at(report, Stage::Commit);
                }
                Ok::<_, ArchiveError>(prepared.locator)
            })
            .await?;

        info!(
            "archived {} to {} ({} cascaded analyses)",
            report,
            locator,
            cascaded.len()
        );
        Ok(locator)
    }

    /// Archive a single analysis as the root of an operation: prepare it,
    /// then drop its tables in a transaction of its own.
    pub async fn archive_analysis(&self, id: i64) -> ArchiveResult<Locator> {
        let analysis = EntityRef::analysis(id);
        self.ensure_present(analysis).await?;

        let prepared = self.prepare_analysis(id).await?;
        if let Err(err) = self
            .ctx
            .catalog
            .commit_archive(analysis, &prepared.locator, &prepared.cleanup)
            .await
        {
            let err = ArchiveError::from(err);
            warn!(
                "{} is marked archived at {} but its tables were not dropped: {}",
                analysis, prepared.locator, err
            );
            return Err(err).at(analysis, Stage::Commit);
        }

        info!("archived {} to {}", analysis, prepared.locator);
        Ok(prepared.locator)
    }

    /// Dump and upload an analysis, mark it archived, and hand back its
    /// cleanup statements without executing them.
    ///
    /// The analysis is marked archived as soon as its dump is safely uploaded
    /// so a concurrent report archive no longer sees it as a dependent.
    pub async fn prepare_analysis(&self, id: i64) -> ArchiveResult<PreparedArchive> {
        let analysis = EntityRef::analysis(id);
        let prepared = self
            .ctx
            .temps
            .with_temp_artifact(|path| async move { self.dump_and_upload(analysis, &path).await })
            .await?;

        if let Err(err) = self
            .ctx
            .catalog
            .mark_archived(analysis, &prepared.locator)
            .await
        {
            let err = ArchiveError::from(err);
            warn_orphaned(analysis, &prepared.locator, &err);
            return Err(err).at(analysis, Stage::Commit);
        }

        info!(
            "prepared {} at {} ({} cleanup statements)",
            analysis,
            prepared.locator,
            prepared.cleanup.len()
        );
        Ok(prepared)
    }

    /// Prepare every analysis in `ids`, at most `cascade_concurrency` at once.
    ///
    /// Fails on the first error; siblings already prepared stay archived.
    async fn cascade_analyses(&self, ids: BTreeSet<i64>) -> ArchiveResult<Vec<PreparedArchive>> {
        stream::iter(
            ids.into_iter()
                .map(|id| Ok::<_, ArchiveError>(self.prepare_analysis(id))),
        )
        .try_buffer_unordered(self.ctx.settings.concurrency())
        .try_collect()
        .await
    }

    /// Recover the drop statements of analyses that are archived but still
    /// own tables, at most `cascade_concurrency` at once.
    async fn reclaim_analyses(&self, ids: BTreeSet<i64>) -> ArchiveResult<Vec<PreparedArchive>> {
        let reclaimed: Vec<Option<PreparedArchive>> = stream::iter(
            ids.into_iter()
                .map(|id| Ok::<_, ArchiveError>(self.reclaim_analysis(id))),
        )
        .try_buffer_unordered(self.ctx.settings.concurrency())
        .try_collect()
        .await?;
        Ok(reclaimed.into_iter().flatten().collect())
    }

    /// Download an archived analysis' dump and extract its drop statements.
    /// Returns `None` if the analysis was restored in the meantime.
    async fn reclaim_analysis(&self, id: i64) -> ArchiveResult<Option<PreparedArchive>> {
        let analysis = EntityRef::analysis(id);
        let Some(record) = self
            .ctx
            .catalog
            .find_archived(analysis)
            .await
            .at(analysis, Stage::Validate)?
        else {
            return Ok(None);
        };
        let Some(raw) = record.archive_location else {
            return Ok(None);
        };
        let locator = Locator::parse(&raw).at(analysis, Stage::Download)?;
        let source = &locator;

        let cleanup = self
            .ctx
            .temps
            .with_temp_artifact(|path| async move {
                self.ctx
                    .objects
                    .download(source, &path)
                    .await
                    .at(analysis, Stage::Download)?;
                self.ctx
                    .dump
                    .cleanup_statements(&path)
                    .await
                    .at(analysis, Stage::ExtractCleanup)
            })
            .await?;

        info!(
            "reclaimed {} cleanup statements for {} from {}",
            cleanup.len(),
            analysis,
            locator
        );
        Ok(Some(PreparedArchive {
            entity: analysis,
            locator,
            cleanup,
        }))
    }

    /// Dump `entity`'s tables into `path`, upload them and extract the
    /// statements that drop those tables.
    async fn dump_and_upload(
        &self,
        entity: EntityRef,
        path: &Path,
    ) -> ArchiveResult<PreparedArchive> {
        let selector = self.ctx.settings.selector(entity);
        self.ctx
            .dump
            .dump(&selector, path)
            .await
            .at(entity, Stage::Dump)?;

        let locator = self
            .ctx
            .objects
            .upload(path, &self.ctx.settings.container, &entity.object_key())
            .await
            .at(entity, Stage::Upload)?;

        let cleanup = match self.ctx.dump.cleanup_statements(path).await {
            Ok(cleanup) => cleanup,
            Err(err) => {
                warn_orphaned(entity, &locator, &err);
                return Err(err).at(entity, Stage::ExtractCleanup);
            }
        };

        Ok(PreparedArchive {
            entity,
            locator,
            cleanup,
        })
    }

    async fn ensure_present(&self, entity: EntityRef) -> ArchiveResult<()> {
        match self
            .ctx
            .catalog
            .find_present(entity)
            .await
            .at(entity, Stage::Validate)?
        {
            Some(_) => Ok(()),
            None => Err(ArchiveError::AlreadyArchivedOrDoesNotExist { entity }),
        }
    }
}

/// An uploaded object that no committed row points at. Left in place; a
/// retry of the same entity overwrites it.
fn warn_orphaned(entity: EntityRef, locator: &Locator, err: &ArchiveError) {
    warn!(
        "orphaned archive object {} for {} after failure: {}",
        locator, entity, err
    );
}
