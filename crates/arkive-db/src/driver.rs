//! Driver registry and the validating connection manager.

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use thiserror::Error;

/// Cheap metadata query used to check SQLite connections.
pub const SQLITE_VALIDATION_QUERY: &str = "SELECT COUNT(*) FROM sqlite_master";

/// Connection drivers this build can pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// SQLite through `rusqlite`. URLs are file paths, `:memory:`, or
    /// `file:` URIs.
    Sqlite,
}

/// The configured driver name is not known.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported driver '{0}'")]
pub struct UnknownDriver(pub String);

impl FromStr for Driver {
    type Err = UnknownDriver;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" | "rusqlite" => Ok(Self::Sqlite),
            _ => Err(UnknownDriver(s.to_string())),
        }
    }
}

impl Driver {
    /// Returns the driver's default validation query.
    pub fn validation_query(self) -> &'static str {
        match self {
            Self::Sqlite => SQLITE_VALIDATION_QUERY,
        }
    }

    /// Builds a connection manager for `url`.
    pub fn manager(self, url: &str) -> SqliteConnectionManager {
        match self {
            Self::Sqlite => {
                let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
                SqliteConnectionManager::file(url).with_flags(flags)
            }
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Runs `query` against `conn`, discarding the result row.
pub fn validate(conn: &Connection, query: &str) -> Result<(), rusqlite::Error> {
    conn.query_row(query, [], |_| Ok(()))
}

/// A pooled SQLite connection that can be flagged for eviction.
///
/// A flagged connection reports itself broken when it is returned, so the
/// pool closes it instead of keeping it idle.
#[derive(Debug)]
pub struct ManagedConnection {
    conn: Connection,
    evict: bool,
}

impl ManagedConnection {
    /// Marks the connection to be closed on return.
    pub fn evict(&mut self) {
        self.evict = true;
    }

    /// Returns `true` once [`evict`](Self::evict) has been called.
    pub fn is_evicted(&self) -> bool {
        self.evict
    }
}

impl Deref for ManagedConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for ManagedConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Wraps a SQLite manager so `is_valid` runs the configured validation query.
pub struct ValidatingManager {
    inner: SqliteConnectionManager,
    validation_query: String,
    test_on_return: bool,
}

impl ValidatingManager {
    /// Wraps `inner`, validating with `validation_query`.
    pub fn new(
        inner: SqliteConnectionManager,
        validation_query: impl Into<String>,
        test_on_return: bool,
    ) -> Self {
        Self {
            inner,
            validation_query: validation_query.into(),
            test_on_return,
        }
    }

    /// Returns the validation query in use.
    pub fn validation_query(&self) -> &str {
        &self.validation_query
    }
}

impl fmt::Debug for ValidatingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatingManager")
            .field("validation_query", &self.validation_query)
            .field("test_on_return", &self.test_on_return)
            .finish_non_exhaustive()
    }
}

impl ManageConnection for ValidatingManager {
    type Connection = ManagedConnection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Ok(ManagedConnection {
            conn: self.inner.connect()?,
            evict: false,
        })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        validate(conn, &self.validation_query)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.evict || (self.test_on_return && validate(conn, &self.validation_query).is_err())
    }
}

/// Routes pool-internal connection errors to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHandler;

impl r2d2::HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::warn!(error = %error, "pooled connection error");
    }
}
