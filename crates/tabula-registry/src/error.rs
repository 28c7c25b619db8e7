use std::path::PathBuf;

use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("registry at {} is corrupt: {reason}", path.display())]
    CorruptRegistry { path: PathBuf, reason: String },
    #[error("{0}")]
    Query(String),
    #[error("duplicate view name: {0}")]
    DuplicateName(String),
    #[error("invalid source reference: {0}")]
    InvalidSource(String),
    #[error("invalid view name: {0}")]
    InvalidName(String),
    #[error("import failed: {0}")]
    Import(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Stable label used in per-item failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Configuration(_) => "configuration_error",
            RegistryError::Connection(_) => "connection_error",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::CorruptRegistry { .. } => "corrupt_registry",
            RegistryError::Query(_) => "query_error",
            RegistryError::DuplicateName(_) => "duplicate_name",
            RegistryError::InvalidSource(_) => "invalid_source",
            RegistryError::InvalidName(_) => "invalid_name",
            RegistryError::Import(_) => "import_error",
            RegistryError::Io(_) => "io_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Whether a caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Connection(_))
    }

    /// Engine errors raised while running SQL. A busy, locked or unopenable
    /// database is a connection problem, not a fault in the statement.
    pub(crate) fn query(err: rusqlite::Error) -> Self {
        if engine_unavailable(&err) {
            return RegistryError::Connection(err.to_string());
        }
        RegistryError::Query(err.to_string())
    }

    /// Engine errors raised while materializing `what`.
    pub(crate) fn import(what: impl std::fmt::Display, err: rusqlite::Error) -> Self {
        if engine_unavailable(&err) {
            return RegistryError::Connection(format!("{what}: {err}"));
        }
        RegistryError::Import(format!("{what}: {err}"))
    }

    pub(crate) fn connection(err: rusqlite::Error) -> Self {
        RegistryError::Connection(err.to_string())
    }
}

/// Serializable form of an error attached to a single batch item.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

fn engine_unavailable(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
    )
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> RegistryError {
    RegistryError::Connection(format!("join error: {}", err))
}
