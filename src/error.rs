// ⚠️ Error taxonomy for the series store
//
// Validation errors (date axis, cardinality, invalid values) are raised before
// anything is written. Storage errors are propagated, never masked.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeriesError {
    /// Uniqueness, cycle or self-membership breach
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// An id, code, name or key that does not resolve to a known entity
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("missing date axis: {0}")]
    MissingDateAxis(String),

    #[error("expected {expected} series names, got {got}")]
    NameCardinalityMismatch { expected: usize, got: usize },

    #[error("expected {expected} group assignments, got {got} (use a broadcast assignment to share groups)")]
    GroupCardinalityMismatch { expected: usize, got: usize },

    /// Non-finite numbers, empty keywords, unparsable cells
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Ragged or empty tabular input
    #[error("invalid table: {0}")]
    InvalidTable(String),

    #[error("tabular input/output failed: {0}")]
    TableIo(#[from] csv::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage failure: {0}")]
    StorageFailure(rusqlite::Error),
}

impl SeriesError {
    /// True when the storage layer reported contention (SQLITE_BUSY / SQLITE_LOCKED).
    /// The store never retries on its own; callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            SeriesError::StorageFailure(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SeriesError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref failure, ref message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let detail = message.clone().unwrap_or_else(|| failure.to_string());
                SeriesError::ConstraintViolation(detail)
            }
            other => SeriesError::StorageFailure(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SeriesError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::db::open_connection;
    use rusqlite::Connection;

    #[test]
    fn test_unique_failure_maps_to_constraint_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (code TEXT UNIQUE NOT NULL)", [])
            .unwrap();
        conn.execute("INSERT INTO t (code) VALUES ('A')", []).unwrap();

        let err: SeriesError = conn
            .execute("INSERT INTO t (code) VALUES ('A')", [])
            .unwrap_err()
            .into();

        match err {
            SeriesError::ConstraintViolation(msg) => assert!(msg.contains("UNIQUE")),
            other => panic!("expected constraint violation, got {other:?}"),
        }
    }

    #[test]
    fn test_other_sqlite_errors_are_storage_failures() {
        let conn = Connection::open_in_memory().unwrap();
        let err: SeriesError = conn
            .execute("INSERT INTO missing_table VALUES (1)", [])
            .unwrap_err()
            .into();

        assert!(matches!(err, SeriesError::StorageFailure(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_locked_writer_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.db");

        let holder = open_connection(&StoreConfig::file(path.clone())).unwrap();
        let waiter = open_connection(&StoreConfig {
            busy_timeout_ms: 0,
            ..StoreConfig::file(path)
        })
        .unwrap();

        holder.execute_batch("BEGIN IMMEDIATE").unwrap();
        let err: SeriesError = waiter
            .execute(
                "INSERT INTO keyword (text, created_at) VALUES ('gdp', '2024-01-01T00:00:00Z')",
                [],
            )
            .unwrap_err()
            .into();
        holder.execute_batch("ROLLBACK").unwrap();

        assert!(err.is_retryable(), "expected SQLITE_BUSY, got {err:?}");
    }
}
