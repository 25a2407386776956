//! Database bootstrap for Arkive.
//!
//! Resolves which backend the process uses from a flat key/value
//! configuration source, optionally starts an in-memory embedded server,
//! and builds the single pooled connection source (`r2d2` over `rusqlite`)
//! the rest of the application borrows connections from.
//!
//! # Design decisions
//!
//! - **Explicit lifecycle**: the host owns one [`DatabaseLifecycleManager`]
//!   and calls `start` and `stop` from its own startup and shutdown path.
//! - **Fixed pool policy**: [`PoolPolicy::default`] carries the production
//!   tuning; it is never changed after the pool is built.
//! - **Readiness polling**: the embedded listener is polled until it answers
//!   or the grace period runs out. Running out is logged, not fatal.

pub mod config;
pub mod driver;
pub mod embedded;
pub mod lifecycle;
pub mod pool;

pub use config::{
    resolve, BackendConfig, BackendMode, ConfigError, ConfigSource, EnvSource, LayeredSource,
};
pub use driver::Driver;
pub use embedded::{EmbeddedServer, EmbeddedServerError, EmbeddedServerSettings};
pub use lifecycle::{DatabaseLifecycleManager, LifecycleSettings, StartupError};
pub use pool::{create_pool, PoolError, PoolPolicy, PoolStatus, PooledConn, PooledConnectionSource};
