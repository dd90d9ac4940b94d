//! Error types for query execution.

use rusqlite::ErrorCode;

use crate::pool::PoolError;

/// Errors surfaced by [`crate::QueryExecutor`].
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No usable connection could be obtained from the pool.
    #[error("database connection unavailable: {0}")]
    Connection(#[from] PoolError),

    /// The session died while a statement was running.
    #[error("database connection lost: {0}")]
    ConnectionLost(#[source] rusqlite::Error),

    /// The driver rejected the statement (syntax, constraint, type).
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// An INSERT completed without producing a row.
    #[error("insert did not produce a generated id")]
    InsertFailed,
}

impl DbError {
    /// Whether the failure came from the connection rather than the SQL.
    ///
    /// Connection failures are worth retrying; query failures are not.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectionLost(_))
    }
}

/// Whether a driver error means the session itself is unusable.
pub(crate) fn is_session_failure(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
        )
    )
}

/// Whether a session failure appears anywhere in an error's source chain.
pub(crate) fn chain_has_session_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    std::iter::successors(Some(err), |e| e.source())
        .filter_map(|e| e.downcast_ref::<rusqlite::Error>())
        .any(is_session_failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_errors_are_distinguishable() {
        let exhausted = DbError::from(PoolError::Exhausted {
            timeout: Duration::from_millis(5),
        });
        assert!(exhausted.is_connection_error());

        let query = DbError::from(rusqlite::Error::InvalidQuery);
        assert!(!query.is_connection_error());
        assert!(!DbError::InsertFailed.is_connection_error());
    }

    #[test]
    fn error_display_includes_context() {
        let e = DbError::from(PoolError::Closed);
        assert_eq!(
            e.to_string(),
            "database connection unavailable: connection pool is closed"
        );

        assert_eq!(
            DbError::InsertFailed.to_string(),
            "insert did not produce a generated id"
        );
    }

    #[test]
    fn io_failures_count_as_session_failures() {
        let io = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            None,
        );
        assert!(is_session_failure(&io));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!is_session_failure(&constraint));
    }

    #[test]
    fn session_failures_are_found_through_wrappers() {
        let lost = DbError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            None,
        ));
        assert!(chain_has_session_failure(&lost));

        let syntax = DbError::from(rusqlite::Error::InvalidQuery);
        assert!(!chain_has_session_failure(&syntax));
        assert!(!chain_has_session_failure(&DbError::InsertFailed));
    }
}
