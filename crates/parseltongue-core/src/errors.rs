//! Error types for the parseltongue core library.

use std::fmt;

/// Internal error for the store and indexing plumbing.
///
/// Public query surfaces convert this into [`QueryError`] before it reaches a
/// caller; per-file indexing failures become [`IndexingFileError`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Corruption(#[from] StoreCorruptionError),
}

pub type PtResult<T> = Result<T, StoreError>;

/// Errors surfaced to store and query clients.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store is corrupted and refuses queries until rebuilt: {0}")]
    Corrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl QueryError {
    /// Stable machine-readable label for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidPattern { .. } => "invalid_pattern",
            QueryError::Storage(_) => "storage",
            QueryError::NotFound(_) => "not_found",
            QueryError::Corrupted(_) => "corrupted",
            QueryError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corruption(c) => QueryError::Corrupted(c.to_string()),
            other => QueryError::Storage(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        QueryError::Storage(err.to_string())
    }
}

/// Raised when stored rows fail integrity verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("corrupted {table} row `{row}`: {detail}")]
pub struct StoreCorruptionError {
    pub table: String,
    pub row: String,
    pub detail: String,
}

/// An external resolver call that did not answer within its deadline.
///
/// Never propagated as a failure: the affected edge degrades to
/// `Unresolved` and the timeout is recorded in the resolution stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionTimeout {
    pub target_name: String,
    pub timeout_ms: u64,
}

impl fmt::Display for ResolutionTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "symbol resolver timed out after {}ms resolving `{}`",
            self.timeout_ms, self.target_name
        )
    }
}

impl std::error::Error for ResolutionTimeout {}

/// A failure confined to one file of an indexing batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexingFileError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to store {path}: {message}")]
    Storage { path: String, message: String },

    #[error("extraction panicked on {path}: {message}")]
    Panicked { path: String, message: String },
}

impl IndexingFileError {
    pub fn path(&self) -> &str {
        match self {
            IndexingFileError::Read { path, .. }
            | IndexingFileError::Storage { path, .. }
            | IndexingFileError::Panicked { path, .. } => path,
        }
    }

    /// Stage label used when the failure is written to the diagnostics table.
    pub fn stage(&self) -> &'static str {
        match self {
            IndexingFileError::Read { .. } => "read",
            IndexingFileError::Storage { .. } => "store",
            IndexingFileError::Panicked { .. } => "extract",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_maps_to_corrupted_query_error() {
        let err = StoreError::Corruption(StoreCorruptionError {
            table: "entities".to_string(),
            row: "rust|a.rs|function|foo".to_string(),
            detail: "checksum mismatch".to_string(),
        });
        assert!(matches!(QueryError::from(err), QueryError::Corrupted(_)));
    }

    #[test]
    fn test_database_error_maps_to_storage() {
        let err = StoreError::Database("disk full".to_string());
        match QueryError::from(err) {
            QueryError::Storage(msg) => assert!(msg.contains("disk full")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_indexing_file_error_accessors() {
        let err = IndexingFileError::Panicked {
            path: "src/lib.rs".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.path(), "src/lib.rs");
        assert_eq!(err.stage(), "extract");
    }

    #[test]
    fn test_resolution_timeout_display() {
        let t = ResolutionTimeout {
            target_name: "bar".to_string(),
            timeout_ms: 2000,
        };
        assert!(t.to_string().contains("2000ms"));
    }
}
