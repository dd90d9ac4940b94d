//! Fixed-capacity connection pool.
//!
//! The pool opens every connection up front and keeps the slot count
//! constant for its whole life: a connection that is found broken on release
//! is replaced, and if the replacement cannot be opened the slot is left
//! *vacant* and reopened by the next caller that needs it. Connection
//! creation and health checks are delegated to an [`r2d2::ManageConnection`]
//! so the same pool serves SQLite in production and fakes in tests.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Number of pooled SQLite connections, all opened at startup.
    pub pool_size: u32,

    /// How long `acquire` waits for an idle connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_size: 5,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Sizing and wait policy for a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Number of connections the pool owns.
    pub capacity: u32,

    /// Default wait used by [`ConnectionPool::acquire`].
    pub acquire_timeout: Duration,
}

impl From<DbRuntimeSettings> for PoolSettings {
    fn from(settings: DbRuntimeSettings) -> Self {
        Self {
            capacity: settings.pool_size,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
        }
    }
}

/// The SQLite pool used by the rest of the workspace.
pub type DbPool = ConnectionPool<SqliteConnectionManager>;

/// Errors raised while obtaining a connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The database could not be reached or refused the session.
    #[error("failed to open database connection: {0}")]
    Connect(String),

    /// No connection became idle within the allowed wait.
    #[error("timed out after {timeout:?} waiting for a database connection")]
    Exhausted {
        /// The wait that elapsed.
        timeout: Duration,
    },

    /// The pool has been shut down with [`ConnectionPool::close_all`].
    #[error("connection pool is closed")]
    Closed,

    /// A pool was requested with zero connections.
    #[error("connection pool capacity must be at least 1")]
    InvalidCapacity,
}

/// Point-in-time view of the pool's slots.
///
/// While the pool is open, `idle + leased + vacant == capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured number of slots.
    pub capacity: usize,
    /// Open connections waiting to be leased.
    pub idle: usize,
    /// Connections currently held by callers.
    pub leased: usize,
    /// Slots whose connection was lost and could not yet be reopened.
    pub vacant: usize,
}

struct Slots<C> {
    idle: VecDeque<C>,
    leased: usize,
    vacant: usize,
    closed: bool,
}

struct Shared<M: ManageConnection> {
    manager: M,
    slots: Mutex<Slots<M::Connection>>,
    available: Condvar,
    settings: PoolSettings,
}

impl<M: ManageConnection> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, Slots<M::Connection>> {
        // Every counter update is a single step, so a poisoned lock is still consistent.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<M::Connection, PoolError> {
        self.manager
            .connect()
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    fn checkout(&self, timeout: Duration) -> Result<M::Connection, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut slots = self.lock();

        loop {
            if slots.closed {
                return Err(PoolError::Closed);
            }

            if let Some(mut conn) = slots.idle.pop_front() {
                slots.leased += 1;
                drop(slots);
                if !self.manager.has_broken(&mut conn) {
                    return Ok(conn);
                }
                tracing::debug!("discarding broken idle connection");
                drop(conn);
                match self.reopen_leased_slot() {
                    Ok(fresh) => return Ok(fresh),
                    Err(e) => {
                        slots = self.lock();
                        if slots.idle.is_empty() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "could not reopen broken idle connection, trying the next one");
                        continue;
                    }
                }
            }

            if slots.vacant > 0 {
                slots.vacant -= 1;
                slots.leased += 1;
                drop(slots);
                return self.reopen_leased_slot();
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Exhausted { timeout });
            }

            slots = match self.available.wait_timeout(slots, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Opens a connection for a slot the caller already counted as leased.
    /// On failure the slot goes back to vacant so capacity is preserved.
    fn reopen_leased_slot(&self) -> Result<M::Connection, PoolError> {
        match self.open() {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut slots = self.lock();
                slots.leased -= 1;
                if !slots.closed {
                    slots.vacant += 1;
                }
                drop(slots);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    fn release(&self, mut conn: M::Connection, marked_broken: bool) {
        let broken = marked_broken || self.manager.has_broken(&mut conn);

        let returned = if broken {
            drop(conn);
            if self.lock().closed {
                None
            } else {
                match self.open() {
                    Ok(fresh) => {
                        tracing::debug!("replaced broken database connection");
                        Some(fresh)
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "failed to replace broken connection, slot will be reopened on next acquire"
                        );
                        None
                    }
                }
            }
        } else {
            Some(conn)
        };

        let mut slots = self.lock();
        slots.leased -= 1;
        let discarded = match returned {
            Some(conn) if !slots.closed => {
                slots.idle.push_back(conn);
                None
            }
            Some(conn) => Some(conn),
            None => {
                if !slots.closed {
                    slots.vacant += 1;
                }
                None
            }
        };
        drop(slots);

        self.available.notify_one();
        drop(discarded);
        tracing::trace!("released database connection");
    }
}

/// A bounded pool of reusable database connections.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.shared.settings)
            .field("status", &self.status())
            .finish()
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Builds a pool and eagerly opens `settings.capacity` connections.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidCapacity` for a zero capacity and
    /// `PoolError::Connect` if any connection fails to open.
    pub fn new(manager: M, settings: PoolSettings) -> Result<Self, PoolError> {
        if settings.capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        let capacity = settings.capacity as usize;
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            let conn = manager
                .connect()
                .map_err(|e| PoolError::Connect(e.to_string()))?;
            idle.push_back(conn);
        }

        tracing::info!(capacity, "database connection pool initialized");

        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                slots: Mutex::new(Slots {
                    idle,
                    leased: 0,
                    vacant: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                settings,
            }),
        })
    }

    /// Leases a connection, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::acquire_timeout`].
    pub fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_timeout(self.shared.settings.acquire_timeout)
    }

    /// Leases a connection, waiting at most `timeout` for one to go idle.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` when the wait elapses,
    /// `PoolError::Closed` after shutdown, and `PoolError::Connect` when a
    /// vacant slot had to be reopened and the database refused.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<M>, PoolError> {
        let conn = self.shared.checkout(timeout).inspect_err(|e| {
            tracing::debug!(error = %e, "failed to lease database connection");
        })?;
        tracing::trace!("leased database connection");

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.shared),
            broken: false,
        })
    }

    /// Returns a leased connection to the pool.
    ///
    /// Equivalent to dropping the lease.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Shuts the pool down.
    ///
    /// Idle connections are closed immediately, blocked callers are woken
    /// with `PoolError::Closed`, and leases still in flight close their
    /// connection when they are released. Calling this more than once is a
    /// no-op.
    pub fn close_all(&self) {
        let mut slots = self.shared.lock();
        if slots.closed {
            return;
        }
        slots.closed = true;
        slots.vacant = 0;
        let drained: Vec<M::Connection> = slots.idle.drain(..).collect();
        let in_flight = slots.leased;
        drop(slots);

        self.shared.available.notify_all();
        let closed = drained.len();
        drop(drained);

        tracing::info!(closed, in_flight, "database connection pool closed");
    }

    /// Reports the current slot accounting.
    pub fn status(&self) -> PoolStatus {
        let slots = self.shared.lock();
        PoolStatus {
            capacity: self.shared.settings.capacity as usize,
            idle: slots.idle.len(),
            leased: slots.leased,
            vacant: slots.vacant,
        }
    }

    /// Number of connections this pool was built with.
    pub fn capacity(&self) -> usize {
        self.shared.settings.capacity as usize
    }
}

/// An exclusive lease on one pooled connection.
///
/// Dereferences to the underlying connection and hands it back to the pool
/// when dropped.
pub struct PooledConnection<M: ManageConnection> {
    conn: Option<M::Connection>,
    pool: Arc<Shared<M>>,
    broken: bool,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Flags the connection as unusable so the pool replaces it on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether [`PooledConnection::mark_broken`] has been called.
    pub fn is_marked_broken(&self) -> bool {
        self.broken
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}

impl<M: ManageConnection> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Creates a SQLite connection pool with WAL mode and foreign keys enabled.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. `:memory:` opens a
///   separate private database per connection, so it is only useful with a
///   pool size of 1.
///
/// # Errors
///
/// Returns `PoolError::Connect` if any of the initial connections cannot be
/// opened or initialized, and `PoolError::InvalidCapacity` for a zero pool
/// size.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // Set WAL mode and verify it was accepted. In-memory databases
            // report "memory" which is expected and acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                settings.busy_timeout_ms
            ))
        });

    tracing::debug!(path = db_path, "opening sqlite connection pool");
    ConnectionPool::new(manager, settings.into())
}
