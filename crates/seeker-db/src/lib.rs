//! Database core for the Seeker backend.
//!
//! Provides a fixed-capacity SQLite connection pool, a parameterized query
//! executor built on it, and a file-based migration manager that applies,
//! tracks, verifies, and rolls back versioned SQL scripts. Application code
//! talks to the database only through [`QueryExecutor`].
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: a single database file, concurrent readers
//!   alongside one writer.
//! - **Eager, fixed-size pool**: every connection is opened at startup so a
//!   bad database path fails fast; broken connections are replaced rather
//!   than dropped, keeping the pool at its configured size.
//! - **Explicit lifetimes**: the pool, executor, and migration manager are
//!   plain values created at startup and passed to whatever needs them.
//!   [`ConnectionPool::close_all`] tears the pool down at shutdown.
//! - **Scripts on disk**: migrations are `.sql` files an operator can
//!   create, review, and pair with rollback scripts. Their SHA-256 is
//!   recorded so later edits are detected instead of silently re-applied.

mod error;
mod executor;
mod migrations;
mod pool;
mod row;
mod update;

pub use error::DbError;
pub use executor::QueryExecutor;
pub use migrations::{
    checksum, ChecksumDrift, CreatedMigration, DownReport, MigrationError, MigrationFile,
    MigrationManager, MigrationRecord, MigrationSettings, MigrationStatus, UpReport,
    DEFAULT_MIGRATIONS_DIR, DEFAULT_MIGRATIONS_TABLE,
};
pub use pool::{
    create_pool, ConnectionPool, DbPool, DbRuntimeSettings, PoolError, PoolSettings, PoolStatus,
    PooledConnection,
};
pub use row::Row;
pub use update::{Column, Patch, UpdateBuilder, UpdateStatement};
