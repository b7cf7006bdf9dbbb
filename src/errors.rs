use crate::models::entity::EntityRef;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Pipeline step an orchestrated operation was in when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Resolve,
    Cascade,
    Reclaim,
    Dump,
    Upload,
    ExtractCleanup,
    Download,
    Restore,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::Resolve => "resolve dependencies",
            Stage::Cascade => "cascade",
            Stage::Reclaim => "reclaim stranded tables",
            Stage::Dump => "dump",
            Stage::Upload => "upload",
            Stage::ExtractCleanup => "extract cleanup statements",
            Stage::Download => "download",
            Stage::Restore => "restore",
            Stage::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Errors raised by the archive and restore orchestrators and their collaborators.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The validating read found no present row: either the entity does not
    /// exist or it is already archived. The two are indistinguishable.
    #[error("{entity} is already archived or does not exist")]
    AlreadyArchivedOrDoesNotExist { entity: EntityRef },

    /// Restore-side counterpart: missing, or already present.
    #[error("{entity} is not archived or does not exist")]
    NotArchivedOrDoesNotExist { entity: EntityRef },

    #[error("`{tool}` failed (exit status {status:?}): {message}")]
    ExternalTool {
        tool: String,
        status: Option<i32>,
        message: String,
    },

    #[error("object transfer failed: {message}")]
    Transfer { message: String },

    #[error("invalid archive locator `{locator}`: {reason}")]
    LocatorFormat { locator: String, reason: String },

    #[error(transparent)]
    Relational(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Adds the entity and pipeline stage to an underlying failure.
    #[error("{stage} failed for {entity}: {source}")]
    Stage {
        entity: EntityRef,
        stage: Stage,
        #[source]
        source: Box<ArchiveError>,
    },
}

/// Flat classification of an [`ArchiveError`], ignoring stage context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyArchivedOrDoesNotExist,
    NotArchivedOrDoesNotExist,
    ExternalTool,
    Transfer,
    LocatorFormat,
    Relational,
    Io,
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::AlreadyArchivedOrDoesNotExist { .. } => {
                ErrorKind::AlreadyArchivedOrDoesNotExist
            }
            ArchiveError::NotArchivedOrDoesNotExist { .. } => ErrorKind::NotArchivedOrDoesNotExist,
            ArchiveError::ExternalTool { .. } => ErrorKind::ExternalTool,
            ArchiveError::Transfer { .. } => ErrorKind::Transfer,
            ArchiveError::LocatorFormat { .. } => ErrorKind::LocatorFormat,
            ArchiveError::Relational(_) => ErrorKind::Relational,
            ArchiveError::Io(_) => ErrorKind::Io,
            ArchiveError::Stage { source, .. } => source.kind(),
        }
    }

    /// Innermost stage recorded on this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ArchiveError::Stage { stage, source, .. } => source.stage().or(Some(*stage)),
            _ => None,
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        ArchiveError::Transfer {
            message: message.into(),
        }
    }
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Attach entity and stage context to a fallible step.
pub trait StageExt<T> {
    fn at(self, entity: EntityRef, stage: Stage) -> ArchiveResult<T>;
}

impl<T, E: Into<ArchiveError>> StageExt<T> for Result<T, E> {
    fn at(self, entity: EntityRef, stage: Stage) -> ArchiveResult<T> {
        self.map_err(|err| ArchiveError::Stage {
            entity,
            stage,
            source: Box::new(err.into()),
        })
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 504 Gateway Timeout
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        let status = match err.kind() {
            ErrorKind::AlreadyArchivedOrDoesNotExist | ErrorKind::NotArchivedOrDoesNotExist => {
                StatusCode::CONFLICT
            }
            ErrorKind::ExternalTool | ErrorKind::Transfer => StatusCode::BAD_GATEWAY,
            ErrorKind::LocatorFormat | ErrorKind::Relational | ErrorKind::Io => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError::new(status, err.to_string())
    }
}
