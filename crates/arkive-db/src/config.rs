//! Backend selection from a flat key/value configuration source.
//!
//! The resolver reads `Globals.DbType` and, for every backend that is not
//! one of the embedded sentinels, the four namespaced connection keys under
//! `Globals.<DbType>.*`. Resolution is a pure function of the source.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

/// Key selecting the backend mode.
pub const DB_TYPE_KEY: &str = "Globals.DbType";

/// Backend id for a private in-process in-memory database.
pub const EMBEDDED_BACKEND_ID: &str = "hsql";

/// Backend id for the managed embedded server.
pub const EMBEDDED_SERVER_BACKEND_ID: &str = "hsql_server";

/// Database name used by both embedded modes.
pub const EMBEDDED_DATABASE_NAME: &str = "ArkiveDB";

const EMBEDDED_DEFAULT_DRIVER: &str = "sqlite";
const EMBEDDED_DEFAULT_USER: &str = "SA";

const DRIVER_FIELD: &str = "DriverClassName";
const URL_FIELD: &str = "Url";
const USER_FIELD: &str = "UserName";
const PASSWORD_FIELD: &str = "Password";
const VALIDATION_QUERY_FIELD: &str = "ValidationQuery";

/// A read-only source of string configuration values.
pub trait ConfigSource {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl ConfigSource for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        BTreeMap::get(self, key).cloned()
    }
}

impl<S: ConfigSource + ?Sized> ConfigSource for &S {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }
}

/// Reads configuration keys from process environment variables.
///
/// A key is looked up verbatim first, then by its upper-snake form:
/// `Globals.mysql.UserName` becomes `GLOBALS_MYSQL_USERNAME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl EnvSource {
    /// Returns the environment variable name used for `key`.
    pub fn var_name(key: &str) -> String {
        key.chars()
            .map(|c| match c {
                '.' | '-' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| std::env::var(Self::var_name(key)).ok())
    }
}

/// Consults several sources in order; the first one holding a key wins.
#[derive(Default)]
pub struct LayeredSource {
    layers: Vec<Box<dyn ConfigSource + Send + Sync>>,
}

impl LayeredSource {
    /// Creates an empty layered source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer with lower precedence than every layer added so far.
    pub fn with_layer(mut self, layer: impl ConfigSource + Send + Sync + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }
}

impl ConfigSource for LayeredSource {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

impl fmt::Debug for LayeredSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredSource")
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// How the selected backend is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Private in-memory database opened directly by the pool.
    Embedded,
    /// In-memory database owned by an embedded server started at boot.
    EmbeddedServer,
    /// Database provisioned outside this process.
    External,
}

impl BackendMode {
    /// Classifies a backend id. Comparison ignores ASCII case.
    pub fn of(backend_id: &str) -> Self {
        if backend_id.eq_ignore_ascii_case(EMBEDDED_SERVER_BACKEND_ID) {
            Self::EmbeddedServer
        } else if backend_id.eq_ignore_ascii_case(EMBEDDED_BACKEND_ID) {
            Self::Embedded
        } else {
            Self::External
        }
    }

    /// Returns `true` for both embedded sentinels.
    pub fn is_embedded(self) -> bool {
        !matches!(self, Self::External)
    }
}

/// Fully resolved connection settings for one backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// The `Globals.DbType` value as configured.
    pub backend_id: String,
    /// Driver name selecting the connection manager.
    pub driver_name: String,
    /// Connection URL handed to the driver.
    pub connection_url: String,
    /// Login user.
    pub username: String,
    /// Login password, if configured.
    pub password: Option<String>,
    /// Overrides the driver's default validation query.
    pub validation_query: Option<String>,
}

impl BackendConfig {
    /// Returns the provisioning mode for this backend.
    pub fn mode(&self) -> BackendMode {
        BackendMode::of(&self.backend_id)
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("backend_id", &self.backend_id)
            .field("driver_name", &self.driver_name)
            .field("connection_url", &self.connection_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("validation_query", &self.validation_query)
            .finish()
    }
}

/// Errors raised while resolving the backend configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `Globals.DbType` is absent or blank.
    #[error("{key} is not set or is empty")]
    MissingBackendId {
        /// The key that was looked up.
        key: &'static str,
    },

    /// A required connection key is absent or blank.
    #[error("incomplete configuration for backend '{backend_id}': {key} is not set")]
    IncompleteBackendConfig {
        /// The selected backend id.
        backend_id: String,
        /// The missing field (`DriverClassName`, `Url` or `UserName`).
        field: &'static str,
        /// The fully qualified key.
        key: String,
    },
}

/// Returns the namespaced key for `field` under `backend_id`.
pub fn backend_key(backend_id: &str, field: &str) -> String {
    format!("Globals.{backend_id}.{field}")
}

fn non_empty(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source.get(key).filter(|value| !value.trim().is_empty())
}

/// Resolves the backend configuration from `source`.
///
/// # Errors
///
/// Returns [`ConfigError::MissingBackendId`] when `Globals.DbType` is absent
/// or blank, and [`ConfigError::IncompleteBackendConfig`] when an external
/// backend lacks its driver, URL or username.
pub fn resolve(source: &dyn ConfigSource) -> Result<BackendConfig, ConfigError> {
    let backend_id = non_empty(source, DB_TYPE_KEY)
        .map(|id| id.trim().to_string())
        .ok_or(ConfigError::MissingBackendId { key: DB_TYPE_KEY })?;

    let lookup = |field: &str| non_empty(source, &backend_key(&backend_id, field));

    let password = source.get(&backend_key(&backend_id, PASSWORD_FIELD));
    let validation_query = lookup(VALIDATION_QUERY_FIELD);

    if BackendMode::of(&backend_id).is_embedded() {
        return Ok(BackendConfig {
            driver_name: lookup(DRIVER_FIELD)
                .unwrap_or_else(|| EMBEDDED_DEFAULT_DRIVER.to_string()),
            connection_url: lookup(URL_FIELD)
                .unwrap_or_else(|| embedded_connection_url(EMBEDDED_DATABASE_NAME)),
            username: lookup(USER_FIELD).unwrap_or_else(|| EMBEDDED_DEFAULT_USER.to_string()),
            password,
            validation_query,
            backend_id,
        });
    }

    let require = |field: &'static str| {
        lookup(field).ok_or_else(|| ConfigError::IncompleteBackendConfig {
            backend_id: backend_id.clone(),
            field,
            key: backend_key(&backend_id, field),
        })
    };

    let driver_name = require(DRIVER_FIELD)?;
    let connection_url = require(URL_FIELD)?;
    let username = require(USER_FIELD)?;

    Ok(BackendConfig {
        backend_id,
        driver_name,
        connection_url,
        username,
        password,
        validation_query,
    })
}

/// Connection URL of the shared in-memory database named `database_name`.
pub fn embedded_connection_url(database_name: &str) -> String {
    format!("file:{database_name}?mode=memory&cache=shared")
}
