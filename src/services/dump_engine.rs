//! src/services/dump_engine.rs
//!
//! Physical dump/restore of an entity's tables. `PgDumpEngine` shells out to
//! `pg_dump` / `pg_restore`; the orchestrators only see [`DumpEngine`].

use crate::errors::{ArchiveError, ArchiveResult};
use async_trait::async_trait;
use std::{path::Path, process::Stdio};
use tokio::process::Command;
use tracing::debug;

/// Set of relational objects (table name patterns) owned by one entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSelector {
    pub table_patterns: Vec<String>,
}

impl ObjectSelector {
    pub fn new(table_patterns: Vec<String>) -> Self {
        Self { table_patterns }
    }

    /// Expand a `{id}` template such as `report_{id}_*`.
    pub fn from_template(template: &str, id: i64) -> Self {
        Self::new(vec![template.replace("{id}", &id.to_string())])
    }
}

#[async_trait]
pub trait DumpEngine: Send + Sync {
    /// Dump exactly the objects named by `selector` into `artifact`.
    async fn dump(&self, selector: &ObjectSelector, artifact: &Path) -> ArchiveResult<()>;

    /// Recreate the objects contained in `artifact`.
    async fn restore(&self, artifact: &Path) -> ArchiveResult<()>;

    /// Ordered statements that drop every object represented in `artifact`.
    async fn cleanup_statements(&self, artifact: &Path) -> ArchiveResult<Vec<String>>;
}

/// `pg_dump` / `pg_restore` backed engine using the custom archive format.
#[derive(Clone, Debug)]
pub struct PgDumpEngine {
    database_url: String,
    pg_dump: String,
    pg_restore: String,
}

impl PgDumpEngine {
    pub fn new(
        database_url: impl Into<String>,
        pg_dump: impl Into<String>,
        pg_restore: impl Into<String>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            pg_dump: pg_dump.into(),
            pg_restore: pg_restore.into(),
        }
    }
}

#[async_trait]
impl DumpEngine for PgDumpEngine {
    async fn dump(&self, selector: &ObjectSelector, artifact: &Path) -> ArchiveResult<()> {
        let mut command = Command::new(&self.pg_dump);
        command
            .arg(format!("--dbname={}", self.database_url))
            .arg("--format=custom")
            .arg("--file")
            .arg(artifact);
        for pattern in &selector.table_patterns {
            command.arg(format!("--table={pattern}"));
        }
        debug!(
            "dumping tables {:?} into {}",
            selector.table_patterns,
            artifact.display()
        );
        run_tool(&self.pg_dump, command).await?;
        Ok(())
    }

    async fn restore(&self, artifact: &Path) -> ArchiveResult<()> {
        let mut command = Command::new(&self.pg_restore);
        command
            .arg(format!("--dbname={}", self.database_url))
            .arg("--exit-on-error")
            .arg("--single-transaction")
            .arg("--no-owner")
            .arg(artifact);
        debug!("restoring {}", artifact.display());
        run_tool(&self.pg_restore, command).await?;
        Ok(())
    }

    async fn cleanup_statements(&self, artifact: &Path) -> ArchiveResult<Vec<String>> {
        let mut command = Command::new(&self.pg_restore);
        command
            .arg("--clean")
            .arg("--if-exists")
            .arg("--schema-only")
            .arg("--file=-")
            .arg(artifact);
        let stdout = run_tool(&self.pg_restore, command).await?;
        let script = String::from_utf8_lossy(&stdout);
        let statements = extract_drop_statements(&script);
        debug!(
            "extracted {} cleanup statements from {}",
            statements.len(),
            artifact.display()
        );
        Ok(statements)
    }
}

/// Run an external tool to completion and return its stdout.
///
/// Spawn failures and non-zero exits both surface as `ExternalTool`; the child
/// is killed if the returned future is dropped.
async fn run_tool(tool: &str, mut command: Command) -> ArchiveResult<Vec<u8>> {
    command.stdin(Stdio::null()).kill_on_drop(true);

    let output = command
        .output()
        .await
        .map_err(|err| ArchiveError::ExternalTool {
            tool: tool.to_string(),
            status: None,
            message: format!("failed to spawn: {err}"),
        })?;

    if !output.status.success() {
        return Err(ArchiveError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.code(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output.stdout)
}

/// Pick the destructive statements out of a `pg_restore --clean` script.
///
/// `pg_restore` emits every clean statement ahead of the first `CREATE`, in
/// the order PostgreSQL needs them: column defaults and constraints are
/// detached before the sequences and tables they reference are dropped.
/// Within that prelude this keeps each `DROP ...;` and every `ALTER ...;`
/// that drops something (`DROP DEFAULT`, `DROP CONSTRAINT`), in script order.
pub fn extract_drop_statements(script: &str) -> Vec<String> {
    script
        .lines()
        .map(str::trim)
        .take_while(|line| !line.to_ascii_uppercase().starts_with("CREATE "))
        .filter(|line| line.ends_with(';'))
        .filter(|line| {
            let upper = line.to_ascii_uppercase();
            upper.starts_with("DROP ") || (upper.starts_with("ALTER ") && upper.contains(" DROP "))
        })
        .map(str::to_string)
        .collect()
}
