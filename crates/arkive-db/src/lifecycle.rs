//! Startup and shutdown of the database layer.
//!
//! [`DatabaseLifecycleManager`] is constructed once by the host process.
//! `start` brings up the embedded server when the backend asks for one and
//! then builds the pool; `stop` tears the server down again. Both are
//! called explicitly from the host's own startup and shutdown sequence.

use crate::config::{
    embedded_connection_url, resolve, BackendConfig, BackendMode, ConfigError, ConfigSource,
    EMBEDDED_DATABASE_NAME,
};
use crate::driver::{Driver, UnknownDriver, ValidatingManager};
use crate::embedded::{EmbeddedServer, EmbeddedServerError, EmbeddedServerSettings};
use crate::pool::{create_pool, IdleSweeper, PoolError, PoolPolicy, PooledConnectionSource};
use thiserror::Error;

/// Tunables for [`DatabaseLifecycleManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Embedded server parameters.
    pub embedded: EmbeddedServerSettings,
    /// Pool sizing and validation policy.
    pub pool: PoolPolicy,
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The backend configuration is missing or incomplete.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The embedded server could not start.
    #[error("embedded server start failure: {0}")]
    EmbeddedServerStartFailure(#[from] EmbeddedServerError),

    /// The configured driver is not available.
    #[error("backend '{backend_id}': {source}")]
    UnsupportedDriver {
        /// The selected backend id.
        backend_id: String,
        /// The parse failure.
        source: UnknownDriver,
    },

    /// The connection pool could not be built.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// `start` already ran on this manager.
    #[error("database lifecycle already started")]
    AlreadyStarted,
}

/// Owns the backend configuration and the embedded server for the process.
#[derive(Debug, Default)]
pub struct DatabaseLifecycleManager {
    settings: LifecycleSettings,
    config: Option<BackendConfig>,
    server: Option<EmbeddedServer>,
    sweeper: Option<IdleSweeper>,
}

impl DatabaseLifecycleManager {
    /// Creates a manager with the fixed production settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with custom settings.
    pub fn with_settings(settings: LifecycleSettings) -> Self {
        Self {
            settings,
            config: None,
            server: None,
            sweeper: None,
        }
    }

    /// Resolves the backend from `source` and starts it.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Config`] when resolution fails, otherwise the
    /// errors of [`start`](Self::start).
    pub fn on_startup(
        &mut self,
        source: &dyn ConfigSource,
    ) -> Result<PooledConnectionSource, StartupError> {
        let config = resolve(source)?;
        self.start(config)
    }

    /// Starts the embedded server if the backend needs one, then builds the
    /// pool.
    ///
    /// # Errors
    ///
    /// Fails with [`StartupError::EmbeddedServerStartFailure`] if the server
    /// cannot start, [`StartupError::UnsupportedDriver`] for an unknown
    /// driver name, and [`StartupError::Pool`] if the pool cannot be built.
    /// No pool is returned on failure and a server started by this call is
    /// stopped again.
    ///
    /// In embedded-server mode a connection URL left at the resolver's
    /// default is replaced by the started server's own URL, so the pool
    /// always reaches the database the server serves.
    pub fn start(
        &mut self,
        mut config: BackendConfig,
    ) -> Result<PooledConnectionSource, StartupError> {
        if self.config.is_some() {
            return Err(StartupError::AlreadyStarted);
        }

        let driver: Driver =
            config
                .driver_name
                .parse()
                .map_err(|source| StartupError::UnsupportedDriver {
                    backend_id: config.backend_id.clone(),
                    source,
                })?;

        if config.mode() == BackendMode::EmbeddedServer {
            let server_url = self.start_embedded_server()?;
            if config.connection_url == embedded_connection_url(EMBEDDED_DATABASE_NAME) {
                config.connection_url = server_url;
            }
        }

        match self.build_pool(driver, &config) {
            Ok(source) => {
                tracing::info!(
                    name = source.name(),
                    backend = %config.backend_id,
                    driver = %driver,
                    url = %config.connection_url,
                    user = %config.username,
                    "initialized pooled connection source"
                );
                self.config = Some(config);
                Ok(source)
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    fn start_embedded_server(&mut self) -> Result<String, StartupError> {
        let settings = &self.settings.embedded;
        let server = EmbeddedServer::start(settings)?;

        tracing::info!(
            database = server.database_name(),
            port = server.listen_port(),
            grace_ms = settings.readiness_grace.as_millis() as u64,
            "embedded server starting, waiting for listener"
        );
        match server.wait_ready(settings.readiness_grace) {
            Ok(waited) => tracing::debug!(
                waited_ms = waited.as_millis() as u64,
                "embedded server ready"
            ),
            Err(e) => tracing::warn!(error = %e, "readiness wait interrupted, continuing"),
        }

        tracing::info!(
            database = server.database_name(),
            storage = %server.storage_path(),
            port = server.listen_port(),
            "embedded server (in-memory mode) started"
        );
        let url = server.connection_url();
        self.server = Some(server);
        Ok(url)
    }

    fn build_pool(
        &mut self,
        driver: Driver,
        config: &BackendConfig,
    ) -> Result<PooledConnectionSource, StartupError> {
        let query = config
            .validation_query
            .as_deref()
            .unwrap_or(driver.validation_query());
        let manager = ValidatingManager::new(
            driver.manager(&config.connection_url),
            query,
            self.settings.pool.test_on_return,
        );
        let source = create_pool(manager, self.settings.pool.clone())?;
        if self.settings.pool.test_while_idle {
            self.sweeper = Some(IdleSweeper::spawn(&source)?);
        }
        Ok(source)
    }

    /// Shutdown hook. Same as [`stop`](Self::stop).
    pub fn on_shutdown(&mut self) {
        self.stop();
    }

    /// Stops the idle sweeper and the embedded server, if running.
    ///
    /// Idempotent and infallible; problems are logged.
    pub fn stop(&mut self) {
        if let Some(mut sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
            tracing::info!(database = server.database_name(), "embedded server stopped");
        }
    }

    /// The running embedded server, if any.
    pub fn embedded_server(&self) -> Option<&EmbeddedServer> {
        self.server.as_ref()
    }

    /// The effective configuration of a successful `start`.
    pub fn backend_config(&self) -> Option<&BackendConfig> {
        self.config.as_ref()
    }
}

impl Drop for DatabaseLifecycleManager {
    fn drop(&mut self) {
        self.stop();
    }
}
