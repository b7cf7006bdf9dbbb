//! Reports and analyses, the two archivable entity kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Which catalog table an entity lives in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Leaf dataset with its own physical tables.
    Report,

    /// Derived dataset referencing one or more reports.
    Analysis,
}

impl EntityKind {
    /// Name of the catalog table holding rows of this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Report => "report",
            EntityKind::Analysis => "analysis",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// A single report or analysis, addressed by kind and id.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn report(id: i64) -> Self {
        Self {
            kind: EntityKind::Report,
            id,
        }
    }

    pub fn analysis(id: i64) -> Self {
        Self {
            kind: EntityKind::Analysis,
            id,
        }
    }

    /// Object key this entity's dump is uploaded under, e.g. `report/42.dump`.
    ///
    /// Deterministic per entity so a retried archive overwrites whatever an
    /// earlier failed attempt left behind.
    pub fn object_key(&self) -> String {
        format!("{}/{}.dump", self.kind, self.id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Archive bookkeeping columns shared by the `report` and `analysis` tables.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ArchiveRecord {
    /// Primary key of the report or analysis.
    pub id: i64,

    /// `<container>/<key>` locator; non-null iff the entity is archived.
    pub archive_location: Option<String>,

    /// When the entity was last archived.
    pub archive_timestamp: Option<DateTime<Utc>>,

    /// When the entity was last restored.
    pub restore_timestamp: Option<DateTime<Utc>>,
}

impl ArchiveRecord {
    pub fn is_archived(&self) -> bool {
        self.archive_location.is_some()
    }
}
