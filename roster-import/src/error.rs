//! Error types for roster-import
//!
//! Every failure surfaces to the immediate caller; nothing here retries.
//! Storage failures are classified once, at the sqlx boundary, into
//! [`ImportError::Conflict`] (natural-key race, busy or locked database) or
//! [`ImportError::Internal`].

use std::time::Duration;
use thiserror::Error;

/// Import error type
#[derive(Debug, Error)]
pub enum ImportError {
    /// Required header(s) absent from the first row
    #[error("Required columns are missing: {}", missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    /// No usable rows left after per-row filtering
    #[error("No valid rows found in the batch")]
    EmptyBatch,

    /// Input bytes are not a readable workbook or delimited text
    #[error("Unreadable input: {0}")]
    Unreadable(String),

    /// Natural-key race or lock contention detected by the storage layer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage failure not attributable to the input
    #[error("Internal error: {0}")]
    Internal(String),

    /// The import transaction could not be started in time
    #[error("Import did not start within {0:?}")]
    StartTimeout(Duration),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Single-record input failed validation
    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl ImportError {
    /// Stable machine-readable kind, used in audit events
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::SchemaMismatch { .. } => "schema_mismatch",
            ImportError::EmptyBatch => "empty_batch",
            ImportError::Unreadable(_) => "unreadable",
            ImportError::Conflict(_) => "conflict",
            ImportError::Internal(_) => "internal",
            ImportError::StartTimeout(_) => "start_timeout",
            ImportError::NotFound(_) => "not_found",
            ImportError::Invalid(_) => "invalid",
        }
    }

    /// Whether resubmitting the identical request may succeed
    ///
    /// Input errors need a caller fix; storage errors are safe to retry
    /// because imports upsert by natural key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::Conflict(_) | ImportError::Internal(_) | ImportError::StartTimeout(_)
        )
    }
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        if is_conflict(&err) {
            ImportError::Conflict(err.to_string())
        } else {
            ImportError::Internal(err.to_string())
        }
    }
}

impl From<roster_common::Error> for ImportError {
    fn from(err: roster_common::Error) -> Self {
        match err {
            roster_common::Error::Database(db_err) => db_err.into(),
            roster_common::Error::NotFound(msg) => ImportError::NotFound(msg),
            other => ImportError::Internal(other.to_string()),
        }
    }
}

/// SQLite primary result codes that signal contention
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_conflict(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };

    if db_err.is_unique_violation() {
        return true;
    }

    // Extended result codes carry the primary code in the low byte
    let contended = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false);

    contended || db_err.message().contains("database is locked")
}
