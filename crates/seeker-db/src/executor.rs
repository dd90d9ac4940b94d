//! Parameterized query execution on top of the connection pool.
//!
//! Every operation leases its own connection for exactly as long as it
//! runs and hands it back on every exit path, including panics, because the
//! lease is a drop guard. SQL text and parameters always travel separately;
//! nothing here formats a value into a statement.

use std::sync::Arc;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use rusqlite::{Connection, Params, Transaction, TransactionBehavior};

use crate::error::{chain_has_session_failure, is_session_failure, DbError};
use crate::pool::{DbPool, PooledConnection};
use crate::row::Row;
use crate::update::UpdateStatement;

type Lease = PooledConnection<SqliteConnectionManager>;

/// Runs statements against a shared [`DbPool`].
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: DbPool,
}

impl QueryExecutor {
    /// Wraps a pool.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// The pool this executor leases from.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runs a read statement and materializes every row.
    ///
    /// An empty result is an empty vector, not an error.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if no connection is available and
    /// `DbError::Query` if the driver rejects the statement.
    pub fn execute_query<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Row>, DbError> {
        let mut conn = self.pool.acquire()?;
        let result = fetch_rows(&conn, sql, params);
        settle(&mut conn, result).inspect_err(|e| {
            tracing::error!(error = %e, "error executing query");
        })
    }

    /// Runs an UPDATE or DELETE and returns the number of affected rows.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute_query`].
    pub fn execute_update<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        let mut conn = self.pool.acquire()?;
        let result = conn.execute(sql, params);
        settle(&mut conn, result).inspect_err(|e| {
            tracing::error!(error = %e, "error executing update");
        })
    }

    /// Runs an INSERT and returns the generated row id.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InsertFailed` if the statement inserted nothing
    /// (for example `INSERT OR IGNORE` hitting an existing key), otherwise
    /// the same errors as [`QueryExecutor::execute_query`].
    pub fn execute_insert<P: Params>(&self, sql: &str, params: P) -> Result<i64, DbError> {
        let mut conn = self.pool.acquire()?;
        let result = conn
            .execute(sql, params)
            .map(|inserted| (inserted, conn.last_insert_rowid()));
        let (inserted, id) = settle(&mut conn, result).inspect_err(|e| {
            tracing::error!(error = %e, "error executing insert");
        })?;

        if inserted == 0 {
            tracing::warn!("insert statement produced no row");
            return Err(DbError::InsertFailed);
        }
        Ok(id)
    }

    /// Runs one statement once per parameter set and returns the total
    /// number of affected rows.
    ///
    /// The statement is prepared once and the whole batch shares one
    /// transaction, so a failure part-way leaves none of the batch behind.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute_query`].
    pub fn execute_many<P, I>(&self, sql: &str, params_list: I) -> Result<usize, DbError>
    where
        P: Params,
        I: IntoIterator<Item = P>,
    {
        let mut conn = self.pool.acquire()?;
        let result = run_batch(&mut conn, sql, params_list);
        settle(&mut conn, result).inspect_err(|e| {
            tracing::error!(error = %e, "error executing batch");
        })
    }

    /// Runs a statement produced by [`crate::UpdateBuilder`].
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute_update`].
    pub fn execute_statement(&self, statement: &UpdateStatement) -> Result<usize, DbError> {
        self.execute_update(
            &statement.sql,
            rusqlite::params_from_iter(statement.params.iter()),
        )
    }

    /// Runs `f` inside one transaction on one leased connection.
    ///
    /// Commits when `f` returns `Ok`, rolls back and returns the caller's
    /// error when it returns `Err`. The connection is released on every
    /// path; if `f` panics the unfinished transaction is rolled back as the
    /// stack unwinds. A caller error whose source chain holds a lost-session
    /// driver error retires the connection instead of returning it to the
    /// idle set.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `f`, or a `DbError` converted into `E`
    /// when the connection cannot be leased or the transaction cannot be
    /// started or committed.
    pub fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<DbError> + std::error::Error + 'static,
    {
        let mut conn = self.pool.acquire().map_err(DbError::from)?;

        match run_in_transaction(&mut conn, f) {
            Ok(value) => Ok(value),
            Err(TxFailure::Caller(e)) => {
                if chain_has_session_failure(&e) {
                    conn.mark_broken();
                    tracing::warn!(error = %e, "transaction aborted by a lost session");
                }
                Err(e)
            }
            Err(TxFailure::Driver(e)) => {
                let err = classify(&mut conn, e);
                tracing::error!(error = %err, "transaction failed");
                Err(err.into())
            }
        }
    }
}

enum TxFailure<E> {
    Driver(rusqlite::Error),
    Caller(E),
}

fn run_in_transaction<T, E, F>(conn: &mut Connection, f: F) -> Result<T, TxFailure<E>>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(TxFailure::Driver)?;

    match f(&tx) {
        Ok(value) => {
            tx.commit().map_err(TxFailure::Driver)?;
            tracing::trace!("transaction committed");
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback() {
                tracing::warn!(error = %rollback, "failed to roll back transaction");
            } else {
                tracing::debug!("transaction rolled back");
            }
            Err(TxFailure::Caller(e))
        }
    }
}

fn fetch_rows<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let width = columns.len();

    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..width)
            .map(|idx| row.get::<_, Value>(idx))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(Row::new(Arc::clone(&columns), values));
    }
    Ok(out)
}

fn run_batch<P, I>(conn: &mut Connection, sql: &str, params_list: I) -> rusqlite::Result<usize>
where
    P: Params,
    I: IntoIterator<Item = P>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut affected = 0;
    {
        let mut stmt = tx.prepare(sql)?;
        for params in params_list {
            affected += stmt.execute(params)?;
        }
    }
    tx.commit()?;
    Ok(affected)
}

fn classify(conn: &mut Lease, err: rusqlite::Error) -> DbError {
    if is_session_failure(&err) {
        conn.mark_broken();
        DbError::ConnectionLost(err)
    } else {
        DbError::Query(err)
    }
}

fn settle<T>(conn: &mut Lease, result: rusqlite::Result<T>) -> Result<T, DbError> {
    result.map_err(|e| classify(conn, e))
}
