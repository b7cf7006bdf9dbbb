//! src/services/catalog.rs
//!
//! Relational bookkeeping for reports and analyses: archive state columns and
//! the `analysis_report` link table. `PgCatalog` is the PostgreSQL-backed
//! implementation; orchestrators only see the [`CatalogStore`] trait.

use crate::{
    models::{
        entity::{ArchiveRecord, EntityKind, EntityRef},
        locator::Locator,
    },
    services::dump_engine::ObjectSelector,
};
use async_trait::async_trait;
use sqlx::{
    Executor, PgPool, Postgres,
    postgres::{PgArguments, PgQueryResult},
    query::Query,
};
use tracing::debug;

/// Relational store consumed by the orchestrators.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Fetch the archive record regardless of state.
    async fn fetch(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>>;

    /// Fetch the record only if the entity is present (not archived).
    async fn find_present(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>>;

    /// Fetch the record only if the entity is archived.
    async fn find_archived(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>>;

    /// Ids of non-archived analyses linked to `report_id`.
    async fn dependent_analyses(&self, report_id: i64) -> sqlx::Result<Vec<i64>>;

    /// Ids of archived analyses linked to `report_id`.
    async fn archived_dependents(&self, report_id: i64) -> sqlx::Result<Vec<i64>>;

    /// Ids of archived reports linked from `analysis_id`.
    async fn needed_reports(&self, analysis_id: i64) -> sqlx::Result<Vec<i64>>;

    /// Record `locator` as the entity's archive location.
    async fn mark_archived(&self, entity: EntityRef, locator: &Locator) -> sqlx::Result<()>;

    /// Clear the archive location and stamp the restore time.
    async fn mark_restored(&self, entity: EntityRef) -> sqlx::Result<()>;

    /// Run `cleanup` followed by the archive-state update for `entity` as a
    /// single transaction.
    async fn commit_archive(
        &self,
        entity: EntityRef,
        locator: &Locator,
        cleanup: &[String],
    ) -> sqlx::Result<()>;

    /// Whether any table matched by `selector` still exists.
    async fn tables_exist(&self, selector: &ObjectSelector) -> sqlx::Result<bool>;

    /// Cheap connectivity probe used by the readiness check.
    async fn health_check(&self) -> sqlx::Result<()>;
}

const RECORD_COLUMNS: &str = "id, archive_location, archive_timestamp, restore_timestamp";

const DEPENDENT_ANALYSES_SQL: &str = "SELECT ar.analysis
     FROM analysis_report ar
     JOIN analysis a ON a.id = ar.analysis
     WHERE ar.report = $1 AND a.archive_location IS NULL";

const ARCHIVED_DEPENDENTS_SQL: &str = "SELECT ar.analysis
     FROM analysis_report ar
     JOIN analysis a ON a.id = ar.analysis
     WHERE ar.report = $1 AND a.archive_location IS NOT NULL";

const TABLES_EXIST_SQL: &str = "SELECT EXISTS (
         SELECT 1
         FROM pg_catalog.pg_class c
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
         WHERE c.relkind IN ('r', 'p')
           AND n.nspname NOT IN ('pg_catalog', 'information_schema')
           AND (n.nspname || '.' || c.relname) ~ ANY($1)
     )";

const NEEDED_REPORTS_SQL: &str = "SELECT ar.report
     FROM analysis_report ar
     JOIN report r ON r.id = ar.report
     WHERE ar.analysis = $1 AND r.archive_location IS NOT NULL";

/// Archive-state filter appended to a record lookup.
#[derive(Clone, Copy, Debug)]
enum StateFilter {
    Any,
    Present,
    Archived,
}

fn select_record_sql(kind: EntityKind, filter: StateFilter) -> String {
    let state = match filter {
        StateFilter::Any => "",
        StateFilter::Present => " AND archive_location IS NULL",
        StateFilter::Archived => " AND archive_location IS NOT NULL",
    };
    format!(
        "SELECT {RECORD_COLUMNS} FROM {} WHERE id = $1{state}",
        kind.table()
    )
}

fn mark_archived_sql(kind: EntityKind) -> String {
    format!(
        "UPDATE {} SET archive_location = $2, archive_timestamp = now(), restore_timestamp = NULL
         WHERE id = $1",
        kind.table()
    )
}

fn mark_restored_sql(kind: EntityKind) -> String {
    format!(
        "UPDATE {} SET archive_location = NULL, archive_timestamp = NULL, restore_timestamp = now()
         WHERE id = $1",
        kind.table()
    )
}

/// Translate a `pg_dump --table` pattern into an anchored regex over
/// `schema.table`. Unqualified patterns match any schema.
fn table_pattern_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    if !pattern.contains('.') {
        regex.push_str("[^.]*\\.");
    }
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if "\\.+()[]{}^$|".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

/// PostgreSQL catalog sharing one connection pool across all operations.
#[derive(Clone, Debug)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_filtered(
        &self,
        entity: EntityRef,
        filter: StateFilter,
    ) -> sqlx::Result<Option<ArchiveRecord>> {
        let sql = select_record_sql(entity.kind, filter);
        sqlx::query_as::<_, ArchiveRecord>(&sql)
            .bind(entity.id)
            .fetch_optional(&self.pool)
            .await
    }
}

fn state_update<'q>(
    sql: &'q str,
    id: i64,
    locator: Option<&Locator>,
) -> Query<'q, Postgres, PgArguments> {
    let query = sqlx::query::<Postgres>(sql).bind(id);
    match locator {
        Some(locator) => query.bind(locator.to_string()),
        None => query,
    }
}

/// A state update that touched no row means the row vanished.
fn ensure_updated(result: PgQueryResult) -> sqlx::Result<()> {
    if result.rows_affected() == 0 {
        return Err(sqlx::Error::RowNotFound);
    }
    Ok(())
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn fetch(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        self.fetch_filtered(entity, StateFilter::Any).await
    }

    async fn find_present(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        self.fetch_filtered(entity, StateFilter::Present).await
    }

    async fn find_archived(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        self.fetch_filtered(entity, StateFilter::Archived).await
    }

    async fn dependent_analyses(&self, report_id: i64) -> sqlx::Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(DEPENDENT_ANALYSES_SQL)
            .bind(report_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn archived_dependents(&self, report_id: i64) -> sqlx::Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(ARCHIVED_DEPENDENTS_SQL)
            .bind(report_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn needed_reports(&self, analysis_id: i64) -> sqlx::Result<Vec<i64>> {
        sqlx::query_scalar::<_, i64>(NEEDED_REPORTS_SQL)
            .bind(analysis_id)
            .fetch_all(&self.pool)
            .await
    }

    async fn mark_archived(&self, entity: EntityRef, locator: &Locator) -> sqlx::Result<()> {
        let sql = mark_archived_sql(entity.kind);
        let result = state_update(&sql, entity.id, Some(locator))
            .execute(&self.pool)
            .await?;
        ensure_updated(result)
    }

    async fn mark_restored(&self, entity: EntityRef) -> sqlx::Result<()> {
        let sql = mark_restored_sql(entity.kind);
        let result = state_update(&sql, entity.id, None)
            .execute(&self.pool)
            .await?;
        ensure_updated(result)
    }

    async fn commit_archive(
        &self,
        entity: EntityRef,
        locator: &Locator,
        cleanup: &[String],
    ) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in cleanup {
            debug!("{}: executing cleanup `{}`", entity, statement);
            tx.execute(sqlx::raw_sql(statement)).await?;
        }
        let sql = mark_archived_sql(entity.kind);
        let result = tx
            .execute(state_update(&sql, entity.id, Some(locator)))
            .await?;
        ensure_updated(result)?;
        tx.commit().await
    }

    async fn tables_exist(&self, selector: &ObjectSelector) -> sqlx::Result<bool> {
        let patterns: Vec<String> = selector
            .table_patterns
            .iter()
            .map(|pattern| table_pattern_regex(pattern))
            .collect();
        sqlx::query_scalar::<_, bool>(TABLES_EXIST_SQL)
            .bind(patterns)
            .fetch_one(&self.pool)
            .await
    }

    async fn health_check(&self) -> sqlx::Result<()> {
        let one = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        if one != 1 {
            return Err(sqlx::Error::Protocol(format!(
                "unexpected health check result: {one}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lookups_filter_on_archive_state() {
        assert_eq!(
            select_record_sql(EntityKind::Report, StateFilter::Present),
            "SELECT id, archive_location, archive_timestamp, restore_timestamp \
             FROM report WHERE id = $1 AND archive_location IS NULL"
        );
        assert!(
            select_record_sql(EntityKind::Analysis, StateFilter::Archived)
                .ends_with("FROM analysis WHERE id = $1 AND archive_location IS NOT NULL")
        );
        assert!(select_record_sql(EntityKind::Report, StateFilter::Any).ends_with("WHERE id = $1"));
    }

    #[test]
    fn table_patterns_become_anchored_regexes() {
        assert_eq!(table_pattern_regex("report_7_*"), "^[^.]*\\.report_7_.*$");
        assert_eq!(
            table_pattern_regex("public.analysis_1?"),
            "^public\\.analysis_1.$"
        );
        assert_eq!(table_pattern_regex("a$b"), "^[^.]*\\.a\\$b$");
    }

    #[test]
    fn state_updates_target_the_entity_table() {
        let archived = mark_archived_sql(EntityKind::Analysis);
        assert!(archived.starts_with("UPDATE analysis SET archive_location = $2"));
        assert!(archived.contains("restore_timestamp = NULL"));

        let restored = mark_restored_sql(EntityKind::Report);
        assert!(restored.starts_with("UPDATE report SET archive_location = NULL"));
        assert!(restored.contains("restore_timestamp = now()"));
    }
}
