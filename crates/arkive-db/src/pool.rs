//! Connection pool creation and tuning policy.

use crate::driver::{validate, TracingErrorHandler, ValidatingManager};
use r2d2::{Pool, PooledConnection};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Logical name the pool is published under.
pub const DATA_SOURCE_NAME: &str = "dataSource";

/// Sizing and validation policy for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Connections opened before the pool is handed out.
    pub initial_size: u32,
    /// Upper bound on open connections.
    pub max_total: u32,
    /// Idle connections kept past an eviction sweep.
    pub max_idle: u32,
    /// Idle connections the pool keeps open at all times.
    pub min_idle: u32,
    /// How long a borrow may block before failing.
    pub max_wait: Duration,
    /// Validate connections when they are borrowed.
    pub test_on_borrow: bool,
    /// Validate connections when they are returned.
    pub test_on_return: bool,
    /// Validate idle connections during eviction sweeps.
    pub test_while_idle: bool,
    /// Period of the idle-eviction sweep.
    pub eviction_interval: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            initial_size: 5,
            max_total: 10,
            max_idle: 5,
            min_idle: 2,
            max_wait: Duration::from_millis(10_000),
            test_on_borrow: true,
            test_on_return: false,
            test_while_idle: true,
            eviction_interval: Duration::from_millis(60_000),
        }
    }
}

impl PoolPolicy {
    /// Checks the sizing invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidPolicy`] unless
    /// `min_idle <= max_idle <= max_total`, `initial_size <= max_total`,
    /// `max_total > 0`, and the eviction interval is non-zero.
    pub fn validate(&self) -> Result<(), PoolError> {
        let reason = if self.max_total == 0 {
            "max_total must be positive"
        } else if self.min_idle > self.max_idle {
            "min_idle exceeds max_idle"
        } else if self.max_idle > self.max_total {
            "max_idle exceeds max_total"
        } else if self.initial_size > self.max_total {
            "initial_size exceeds max_total"
        } else if self.eviction_interval.is_zero() {
            "eviction_interval must be positive"
        } else {
            return Ok(());
        };
        Err(PoolError::InvalidPolicy(reason))
    }
}

/// Errors raised by pool construction and borrowing.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The policy violates a sizing invariant.
    #[error("invalid pool policy: {0}")]
    InvalidPolicy(&'static str),

    /// Failed to build the connection pool.
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[source] r2d2::Error),

    /// No connection became available within the wait limit.
    #[error("no connection available after {waited:?}: {source}")]
    Exhausted {
        /// How long the borrower waited.
        waited: Duration,
        /// The underlying pool error.
        source: r2d2::Error,
    },

    /// The idle sweeper thread could not be spawned.
    #[error("failed to spawn idle sweeper: {0}")]
    Sweeper(#[source] std::io::Error),
}

/// A connection borrowed from a [`PooledConnectionSource`].
///
/// Dereferences to [`rusqlite::Connection`]. On drop it goes back to the
/// pool, unless the pool already holds `max_idle` idle connections, in
/// which case it is closed.
pub struct PooledConn {
    inner: PooledConnection<ValidatingManager>,
    pool: Pool<ValidatingManager>,
    max_idle: u32,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.inner
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.inner
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.pool.state().idle_connections >= self.max_idle {
            self.inner.evict();
        }
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("max_idle", &self.max_idle)
            .finish_non_exhaustive()
    }
}

/// Live counters for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or borrowed.
    pub connections: u32,
    /// Connections currently idle.
    pub idle_connections: u32,
}

/// The pooled connection source shared with the rest of the application.
///
/// Clones share the same underlying pool.
#[derive(Clone)]
pub struct PooledConnectionSource {
    pool: Pool<ValidatingManager>,
    policy: PoolPolicy,
    validation_query: Arc<str>,
}

impl PooledConnectionSource {
    /// Logical name of this source.
    pub fn name(&self) -> &'static str {
        DATA_SOURCE_NAME
    }

    /// The policy the pool was built with.
    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    /// The query used to validate connections.
    pub fn validation_query(&self) -> &str {
        &self.validation_query
    }

    /// Borrows a connection, waiting up to the policy's `max_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if no connection becomes available.
    pub fn get(&self) -> Result<PooledConn, PoolError> {
        self.get_timeout(self.policy.max_wait)
    }

    /// Borrows a connection, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if no connection becomes available.
    pub fn get_timeout(&self, timeout: Duration) -> Result<PooledConn, PoolError> {
        let inner = self
            .pool
            .get_timeout(timeout)
            .map_err(|source| PoolError::Exhausted {
                waited: timeout,
                source,
            })?;
        Ok(PooledConn {
            inner,
            pool: self.pool.clone(),
            max_idle: self.policy.max_idle,
        })
    }

    /// Returns the current connection counts.
    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

impl std::fmt::Debug for PooledConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnectionSource")
            .field("name", &DATA_SOURCE_NAME)
            .field("policy", &self.policy)
            .field("status", &self.status())
            .finish()
    }
}

/// Creates a pool for `manager` tuned by `policy`.
///
/// The pool is warmed up to `initial_size` open connections before it is
/// returned.
///
/// # Errors
///
/// Returns [`PoolError::InvalidPolicy`] for a policy that breaks its
/// invariants and [`PoolError::PoolInit`] if connections cannot be opened
/// and validated within `max_wait`.
pub fn create_pool(
    manager: ValidatingManager,
    policy: PoolPolicy,
) -> Result<PooledConnectionSource, PoolError> {
    policy.validate()?;
    let validation_query: Arc<str> = Arc::from(manager.validation_query());

    let pool = Pool::builder()
        .max_size(policy.max_total)
        .min_idle(Some(policy.min_idle))
        .connection_timeout(policy.max_wait)
        .test_on_check_out(policy.test_on_borrow)
        .idle_timeout(Some(policy.eviction_interval))
        .error_handler(Box::new(TracingErrorHandler))
        .build(manager)
        .map_err(PoolError::PoolInit)?;

    {
        let warm: Vec<_> = (0..policy.initial_size)
            .map(|_| pool.get())
            .collect::<Result<_, _>>()
            .map_err(PoolError::PoolInit)?;
        tracing::debug!(connections = warm.len(), "pool warmed up");
    }

    Ok(PooledConnectionSource {
        pool,
        policy,
        validation_query,
    })
}

/// Background thread that periodically checks idle connections.
///
/// Each sweep borrows every idle connection, evicts those that fail
/// validation and any beyond `max_idle`, then returns the rest.
pub(crate) struct IdleSweeper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    pub(crate) fn spawn(source: &PooledConnectionSource) -> Result<Self, PoolError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let source = source.clone();
        let interval = source.policy.eviction_interval;

        let handle = thread::Builder::new()
            .name("arkive-idle-sweep".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => sweep(&source),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(PoolError::Sweeper)?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        // Dropping the sender wakes the thread.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("idle sweeper thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for IdleSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleSweeper")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(source: &PooledConnectionSource) {
    let idle = source.pool.state().idle_connections;
    let mut held: Vec<_> = (0..idle).filter_map(|_| source.pool.try_get()).collect();
    let skipped = idle as usize - held.len();

    // Checkout already validated them when test_on_borrow is set.
    let mut failed = 0;
    if !source.policy.test_on_borrow {
        for conn in &mut held {
            if validate(conn, &source.validation_query).is_err() {
                conn.evict();
                failed += 1;
            }
        }
    }

    let mut trimmed = 0;
    let mut kept = 0;
    for conn in &mut held {
        if conn.is_evicted() {
            continue;
        }
        if kept < source.policy.max_idle {
            kept += 1;
        } else {
            conn.evict();
            trimmed += 1;
        }
    }
    drop(held);

    let status = source.status();
    if skipped > 0 || failed > 0 {
        tracing::warn!(
            skipped,
            failed,
            idle = status.idle_connections,
            "idle sweep evicted connections that failed validation"
        );
    }
    tracing::trace!(
        trimmed,
        idle = status.idle_connections,
        connections = status.connections,
        "idle sweep complete"
    );
}
