//! In-memory collaborators for orchestrator tests.
//!
//! `FakeDatabase` models the catalog rows, the link table, the live physical
//! tables and the object store behind one lock, so tests can observe every
//! side effect of an orchestrated operation. Mutations are appended to a
//! journal for ordering assertions; failpoints inject stage failures.

use crate::{
    errors::{ArchiveError, ArchiveResult},
    models::{
        entity::{ArchiveRecord, EntityRef},
        locator::Locator,
    },
    services::{
        ArchiveSettings, Collaborators,
        catalog::CatalogStore,
        dump_engine::{DumpEngine, ObjectSelector},
        object_store::ObjectStore,
        temp_artifact::TempArtifacts,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::fs;

const DROP_PREFIX: &str = "DROP TABLE IF EXISTS ";

/// Pipeline stage at which a fake collaborator should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Failpoint {
    Dump,
    Upload,
    ExtractCleanup,
    Download,
    Restore,
    Commit,
    MarkRestored,
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<EntityRef, ArchiveRecord>,
    links: BTreeSet<(i64, i64)>,
    tables: BTreeMap<String, String>,
    objects: BTreeMap<String, Vec<u8>>,
    failpoints: HashSet<Failpoint>,
    journal: Vec<String>,
    artifacts: Vec<PathBuf>,
    commits: Vec<(EntityRef, Vec<String>)>,
    tool_delay: Option<Duration>,
    tools_running: usize,
    peak_tools_running: usize,
}

#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings() -> ArchiveSettings {
        ArchiveSettings {
            container: "cold-archive".into(),
            report_tables: "report_{id}_*".into(),
            analysis_tables: "analysis_{id}_*".into(),
            cascade_concurrency: 2,
        }
    }

    pub fn catalog(&self) -> Arc<dyn CatalogStore> {
        Arc::new(MemoryCatalog(self.clone()))
    }

    pub fn collaborators(&self, temp_dir: &Path) -> Collaborators {
        Collaborators {
            catalog: self.catalog(),
            dump: Arc::new(FakeDumpEngine(self.clone())),
            objects: Arc::new(MemoryObjectStore(self.clone())),
            temps: TempArtifacts::new(temp_dir.join("staging")),
            settings: Arc::new(Self::settings()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn insert(&self, entity: EntityRef, tables: &[&str]) {
        let mut state = self.lock();
        state.records.insert(
            entity,
            ArchiveRecord {
                id: entity.id,
                archive_location: None,
                archive_timestamp: None,
                restore_timestamp: None,
            },
        );
        for table in tables {
            state
                .tables
                .insert(table.to_string(), format!("rows of {table}"));
        }
    }

    pub fn add_report(&self, id: i64, tables: &[&str]) {
        self.insert(EntityRef::report(id), tables);
    }

    pub fn add_analysis(&self, id: i64, reports: &[i64], tables: &[&str]) {
        self.insert(EntityRef::analysis(id), tables);
        let mut state = self.lock();
        for report in reports {
            state.links.insert((id, *report));
        }
    }

    pub fn set_location(&self, entity: EntityRef, locator: Option<Locator>) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&entity) {
            record.archive_timestamp = locator.as_ref().map(|_| Utc::now());
            record.archive_location = locator.map(|l| l.to_string());
        }
    }

    pub fn record(&self, entity: EntityRef) -> Option<ArchiveRecord> {
        self.lock().records.get(&entity).cloned()
    }

    pub fn table(&self, name: &str) -> Option<String> {
        self.lock().tables.get(name).cloned()
    }

    pub fn tables(&self) -> BTreeMap<String, String> {
        self.lock().tables.clone()
    }

    pub fn has_object(&self, locator: &str) -> bool {
        self.lock().objects.contains_key(locator)
    }

    pub fn fail_at(&self, failpoint: Failpoint) {
        self.lock().failpoints.insert(failpoint);
    }

    pub fn clear_failpoints(&self) {
        self.lock().failpoints.clear();
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Every temp artifact path a fake collaborator was handed.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.lock().artifacts.clone()
    }

    /// Transactions committed through `commit_archive`, in order.
    pub fn commits(&self) -> Vec<(EntityRef, Vec<String>)> {
        self.lock().commits.clone()
    }

    /// Keep every fake dump and restore busy for `delay`, so overlapping
    /// cascade siblings become observable.
    pub fn set_tool_delay(&self, delay: Duration) {
        self.lock().tool_delay = Some(delay);
    }

    /// Most dump/restore calls that were ever running at the same time.
    pub fn peak_tools_running(&self) -> usize {
        self.lock().peak_tools_running
    }

    async fn occupy_tool(&self) {
        let delay = {
            let mut state = self.lock();
            state.tools_running += 1;
            state.peak_tools_running = state.peak_tools_running.max(state.tools_running);
            state.tool_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().tools_running -= 1;
    }

    fn failing(&self, failpoint: Failpoint) -> bool {
        self.lock().failpoints.contains(&failpoint)
    }

    fn touch(&self, artifact: &Path) {
        self.lock().artifacts.push(artifact.to_path_buf());
    }

    fn log(&self, event: String) {
        self.lock().journal.push(event);
    }

    fn set_archived(
        state: &mut FakeState,
        entity: EntityRef,
        locator: &Locator,
    ) -> sqlx::Result<()> {
        let record = state
            .records
            .get_mut(&entity)
            .ok_or(sqlx::Error::RowNotFound)?;
        record.archive_location = Some(locator.to_string());
        record.archive_timestamp = Some(Utc::now());
        record.restore_timestamp = None;
        Ok(())
    }
}

fn injected(stage: &str) -> String {
    format!("injected {stage} failure")
}

/// Parse the fake dump format: one `name\tcontents` line per table.
fn parse_dump(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(name, rows)| (name.to_string(), rows.to_string()))
        .collect()
}

fn matches_pattern(table: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => table.starts_with(prefix),
        None => table == pattern,
    }
}

pub struct MemoryCatalog(FakeDatabase);

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn fetch(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        Ok(self.0.record(entity))
    }

    async fn find_present(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        Ok(self.0.record(entity).filter(|r| !r.is_archived()))
    }

    async fn find_archived(&self, entity: EntityRef) -> sqlx::Result<Option<ArchiveRecord>> {
        Ok(self.0.record(entity).filter(|r| r.is_archived()))
    }

    async fn dependent_analyses(&self, report_id: i64) -> sqlx::Result<Vec<i64>> {
        let state = self.0.lock();
        Ok(state
            .links
            .iter()
            .filter(|(_, report)| *report == report_id)
            .map(|(analysis, _)| *analysis)
            .filter(|analysis| {
                state
                    .records
                    .get(&EntityRef::analysis(*analysis))
                    .is_some_and(|r| !r.is_archived())
            })
            .collect())
    }

    async fn archived_dependents(&self, report_id: i64) -> sqlx::Result<Vec<i64>> {
        let state = self.0.lock();
        Ok(state
            .links
            .iter()
            .filter(|(_, report)| *report == report_id)
            .map(|(analysis, _)| *analysis)
            .filter(|analysis| {
                state
                    .records
                    .get(&EntityRef::analysis(*analysis))
                    .is_some_and(|r| r.is_archived())
            })
            .collect())
    }

    async fn needed_reports(&self, analysis_id: i64) -> sqlx::Result<Vec<i64>> {
        let state = self.0.lock();
        Ok(state
            .links
            .iter()
            .filter(|(analysis, _)| *analysis == analysis_id)
            .map(|(_, report)| *report)
            .filter(|report| {
                state
                    .records
                    .get(&EntityRef::report(*report))
                    .is_some_and(|r| r.is_archived())
            })
            .collect())
    }

    async fn mark_archived(&self, entity: EntityRef, locator: &Locator) -> sqlx::Result<()> {
        let mut state = self.0.lock();
        FakeDatabase::set_archived(&mut state, entity, locator)?;
        state.journal.push(format!("mark_archived {entity}"));
        Ok(())
    }

    async fn mark_restored(&self, entity: EntityRef) -> sqlx::Result<()> {
        if self.0.failing(Failpoint::MarkRestored) {
            return Err(sqlx::Error::Protocol(injected("mark restored")));
        }
        let mut state = self.0.lock();
        let record = state
            .records
            .get_mut(&entity)
            .ok_or(sqlx::Error::RowNotFound)?;
        record.archive_location = None;
        record.archive_timestamp = None;
        record.restore_timestamp = Some(Utc::now());
        state.journal.push(format!("mark_restored {entity}"));
        Ok(())
    }

    async fn commit_archive(
        &self,
        entity: EntityRef,
        locator: &Locator,
        cleanup: &[String],
    ) -> sqlx::Result<()> {
        if self.0.failing(Failpoint::Commit) {
            return Err(sqlx::Error::Protocol(injected("commit")));
        }
        let mut state = self.0.lock();
        for statement in cleanup {
            let table = statement
                .strip_prefix(DROP_PREFIX)
                .and_then(|rest| rest.strip_suffix(';'))
                .ok_or_else(|| sqlx::Error::Protocol(format!("unsupported `{statement}`")))?;
            state.tables.remove(table);
        }
        FakeDatabase::set_archived(&mut state, entity, locator)?;
        state.journal.push(format!("commit {entity}"));
        state.commits.push((entity, cleanup.to_vec()));
        Ok(())
    }

    async fn tables_exist(&self, selector: &ObjectSelector) -> sqlx::Result<bool> {
        let state = self.0.lock();
        Ok(state.tables.keys().any(|name| {
            selector
                .table_patterns
                .iter()
                .any(|pattern| matches_pattern(name, pattern))
        }))
    }

    async fn health_check(&self) -> sqlx::Result<()> {
        Ok(())
    }
}

pub struct FakeDumpEngine(FakeDatabase);

#[async_trait]
impl DumpEngine for FakeDumpEngine {
    async fn dump(&self, selector: &ObjectSelector, artifact: &Path) -> ArchiveResult<()> {
        self.0.touch(artifact);
        if self.0.failing(Failpoint::Dump) {
            return Err(ArchiveError::ExternalTool {
                tool: "pg_dump".into(),
                status: Some(1),
                message: injected("dump"),
            });
        }
        self.0.occupy_tool().await;

        let contents: String = {
            let state = self.0.lock();
            state
                .tables
                .iter()
                .filter(|(name, _)| {
                    selector
                        .table_patterns
                        .iter()
                        .any(|pattern| matches_pattern(name, pattern))
                })
                .map(|(name, rows)| format!("{name}\t{rows}\n"))
                .collect()
        };
        fs::write(artifact, contents).await?;
        self.0
            .log(format!("dump {}", selector.table_patterns.join(",")));
        Ok(())
    }

    async fn restore(&self, artifact: &Path) -> ArchiveResult<()> {
        self.0.touch(artifact);
        if self.0.failing(Failpoint::Restore) {
            return Err(ArchiveError::ExternalTool {
                tool: "pg_restore".into(),
                status: Some(1),
                message: injected("restore"),
            });
        }
        self.0.occupy_tool().await;

        let tables = parse_dump(&fs::read_to_string(artifact).await?);
        let names: Vec<String> = tables.keys().cloned().collect();
        {
            let mut state = self.0.lock();
            state.tables.extend(tables);
        }
        self.0.log(format!("restore {}", names.join(",")));
        Ok(())
    }

    async fn cleanup_statements(&self, artifact: &Path) -> ArchiveResult<Vec<String>> {
        self.0.touch(artifact);
        if self.0.failing(Failpoint::ExtractCleanup) {
            return Err(ArchiveError::ExternalTool {
                tool: "pg_restore".into(),
                status: Some(1),
                message: injected("cleanup extraction"),
            });
        }

        let tables = parse_dump(&fs::read_to_string(artifact).await?);
        Ok(tables
            .keys()
            .map(|name| format!("{DROP_PREFIX}{name};"))
            .collect())
    }
}

pub struct MemoryObjectStore(FakeDatabase);

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(
        &self,
        artifact: &Path,
        container: &str,
        key: &str,
    ) -> Result<Locator, ArchiveError> {
        self.0.touch(artifact);
        if self.0.failing(Failpoint::Upload) {
            return Err(ArchiveError::transfer(injected("upload")));
        }

        let bytes = fs::read(artifact).await?;
        let locator = Locator::new(container, key);
        let mut state = self.0.lock();
        state.objects.insert(locator.to_string(), bytes);
        state.journal.push(format!("upload {locator}"));
        Ok(locator)
    }

    async fn download(&self, locator: &Locator, artifact: &Path) -> Result<(), ArchiveError> {
        self.0.touch(artifact);
        if self.0.failing(Failpoint::Download) {
            return Err(ArchiveError::transfer(injected("download")));
        }

        let bytes = self
            .0
            .lock()
            .objects
            .get(&locator.to_string())
            .cloned()
            .ok_or_else(|| ArchiveError::transfer(format!("object {locator} not found")))?;
        fs::write(artifact, bytes).await?;
        self.0.log(format!("download {locator}"));
        Ok(())
    }
}
