//! Dependency resolution across the `analysis_report` link table.
//!
//! Both lookups are pure reads; an empty set means no cascade is needed.

use crate::{
    models::entity::EntityRef,
    services::{ArchiveSettings, catalog::CatalogStore},
};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

#[derive(Clone)]
pub struct DependencyResolver {
    catalog: Arc<dyn CatalogStore>,
}

impl DependencyResolver {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Analyses that reference `report_id` and are still present. These must
    /// be archived before the report's tables can be dropped.
    pub async fn dependent_analyses(&self, report_id: i64) -> sqlx::Result<BTreeSet<i64>> {
        let ids: BTreeSet<i64> = self
            .catalog
            .dependent_analyses(report_id)
            .await?
            .into_iter()
            .collect();
        debug!("report {} has {} present dependent analyses", report_id, ids.len());
        Ok(ids)
    }

    /// Archived analyses that reference `report_id` but whose tables are
    /// still in the database. A report archive that failed after its cascade
    /// leaves analyses in this state; the next archive of the report drops
    /// their tables along with its own.
    pub async fn stranded_analyses(
        &self,
        report_id: i64,
        settings: &ArchiveSettings,
    ) -> sqlx::Result<BTreeSet<i64>> {
        let mut ids = BTreeSet::new();
        for id in self.catalog.archived_dependents(report_id).await? {
            let selector = settings.selector(EntityRef::analysis(id));
            if self.catalog.tables_exist(&selector).await? {
                ids.insert(id);
            }
        }
        if !ids.is_empty() {
            debug!("report {} has stranded analyses {:?}", report_id, ids);
        }
        Ok(ids)
    }

    /// Archived reports that `analysis_id` references. These must be restored
    /// before the analysis itself.
    pub async fn needed_reports(&self, analysis_id: i64) -> sqlx::Result<BTreeSet<i64>> {
        let ids: BTreeSet<i64> = self
            .catalog
            .needed_reports(analysis_id)
            .await?
            .into_iter()
            .collect();
        debug!("analysis {} needs {} archived reports", analysis_id, ids.len());
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{entity::EntityRef, locator::Locator},
        services::test_support::FakeDatabase,
    };

    #[tokio::test]
    async fn dependent_analyses_skip_archived_ones() {
        let db = FakeDatabase::new();
        db.add_report(1, &["report_1_rows"]);
        db.add_analysis(10, &[1], &["analysis_10_rows"]);
        db.add_analysis(11, &[1], &["analysis_11_rows"]);
        db.add_analysis(12, &[2], &["analysis_12_rows"]);
        db.set_location(EntityRef::analysis(11), Some(Locator::new("c", "analysis/11.dump")));

        let resolver = DependencyResolver::new(db.catalog());
        let ids = resolver.dependent_analyses(1).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![10]);
    }

    #[tokio::test]
    async fn needed_reports_only_lists_archived_reports() {
        let db = FakeDatabase::new();
        db.add_report(1, &["report_1_rows"]);
        db.add_report(2, &["report_2_rows"]);
        db.add_analysis(10, &[1, 2], &["analysis_10_rows"]);
        db.set_location(EntityRef::report(2), Some(Locator::new("c", "report/2.dump")));

        let resolver = DependencyResolver::new(db.catalog());
        let ids = resolver.needed_reports(10).await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn stranded_analyses_are_archived_ones_with_tables_left() {
        let db = FakeDatabase::new();
        db.add_report(1, &["report_1_rows"]);
        db.add_analysis(10, &[1], &["analysis_10_rows"]);
        db.add_analysis(11, &[1], &[]);
        db.add_analysis(12, &[1], &["analysis_12_rows"]);
        db.set_location(EntityRef::analysis(10), Some(Locator::new("c", "analysis/10.dump")));
        db.set_location(EntityRef::analysis(11), Some(Locator::new("c", "analysis/11.dump")));

        let resolver = DependencyResolver::new(db.catalog());
        let ids = resolver
            .stranded_analyses(1, &FakeDatabase::settings())
            .await
            .unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![10]);
    }

    #[tokio::test]
    async fn unlinked_entities_resolve_to_empty_sets() {
        let db = FakeDatabase::new();
        db.add_report(1, &["report_1_rows"]);

        let resolver = DependencyResolver::new(db.catalog());
        assert!(resolver.dependent_analyses(1).await.unwrap().is_empty());
        assert!(resolver.needed_reports(99).await.unwrap().is_empty());
        assert!(
            resolver
                .stranded_analyses(1, &FakeDatabase::settings())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
