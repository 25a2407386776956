//! Host configuration loading from file and environment variables.
//!
//! The TOML file carries a `[logging]` section for the host and a
//! `[Globals]` tree for the database layer. `[Globals]` is flattened into
//! dotted keys (`Globals.mysql.Url`) before it reaches the resolver.

use arkive_db::{ConfigSource, EnvSource, LayeredSource};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level host configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,

    /// Flattened `Globals.*` keys from the file.
    pub globals: BTreeMap<String, String>,

    /// Where the values came from.
    pub origin: ConfigOrigin,
}

/// How [`load_config`] arrived at its result.
///
/// Loading runs before logging is initialized, so the caller reports this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from the file at the given path.
    File,
    /// A path was given but no file exists there.
    Missing,
    /// No path was given.
    #[default]
    Defaults,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "arkive_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    logging: Option<LoggingConfig>,

    #[serde(default, rename = "Globals")]
    globals: Option<toml::Table>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Builds the source the database layer resolves against.
    ///
    /// Environment variables take precedence over the file.
    pub fn database_source(&self) -> impl ConfigSource {
        LayeredSource::new()
            .with_layer(EnvSource)
            .with_layer(self.globals.clone())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A `[Globals]` entry is not a scalar or table.
    #[error("unsupported value for {key}: expected a string, number or boolean")]
    UnsupportedValue {
        /// The dotted key of the entry.
        key: String,
    },
}

/// Parses configuration from TOML text.
///
/// # Errors
///
/// Returns `ConfigError` if the text is not valid TOML or `[Globals]` holds
/// arrays.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let file: FileConfig = toml::from_str(contents)?;
    let mut globals = BTreeMap::new();
    if let Some(table) = &file.globals {
        flatten("Globals", table, &mut globals)?;
    }
    Ok(Config {
        logging: file.logging.unwrap_or_default(),
        globals,
        origin: ConfigOrigin::File,
    })
}

fn flatten(
    prefix: &str,
    table: &toml::Table,
    out: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (name, value) in table {
        let key = format!("{prefix}.{name}");
        match value {
            toml::Value::Table(inner) => flatten(&key, inner, out)?,
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Integer(i) => {
                out.insert(key, i.to_string());
            }
            toml::Value::Float(f) => {
                out.insert(key, f.to_string());
            }
            toml::Value::Boolean(b) => {
                out.insert(key, b.to_string());
            }
            toml::Value::Datetime(_) | toml::Value::Array(_) => {
                return Err(ConfigError::UnsupportedValue { key });
            }
        }
    }
    Ok(())
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Nothing is logged here; [`Config::origin`] records whether the file was
/// found.
///
/// Environment variable overrides:
/// - `ARKIVE_LOG_LEVEL` overrides `logging.level`
/// - `ARKIVE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// `Globals.*` keys are overridden at lookup time through
/// [`Config::database_source`].
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config {
                origin: ConfigOrigin::Missing,
                ..Config::default()
            },
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(level) = std::env::var("ARKIVE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("ARKIVE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globals_are_flattened_to_dotted_keys() {
        let config = parse_config(
            r#"
            [logging]
            level = "debug"

            [Globals]
            DbType = "mysql"

            [Globals.mysql]
            DriverClassName = "sqlite"
            Url = "/srv/arkive.db"
            UserName = "arkive"
            Password = "pw"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
        assert_eq!(config.globals.get("Globals.DbType").map(String::as_str), Some("mysql"));
        assert_eq!(
            config.globals.get("Globals.mysql.Url").map(String::as_str),
            Some("/srv/arkive.db")
        );

        let resolved = arkive_db::resolve(&config.globals).expect("should resolve");
        assert_eq!(resolved.username, "arkive");
        assert_eq!(resolved.password.as_deref(), Some("pw"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_config("").expect("empty config should parse");
        assert_eq!(config.logging.level, "info");
        assert!(config.globals.is_empty());
    }

    #[test]
    fn arrays_in_globals_are_rejected() {
        let err = parse_config("[Globals]\nDbType = [\"a\", \"b\"]\n")
            .expect_err("arrays are not supported");
        assert!(matches!(err, ConfigError::UnsupportedValue { key } if key == "Globals.DbType"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("missing file is not an error");
        assert!(config.globals.is_empty());
        assert_eq!(config.origin, ConfigOrigin::Missing);
    }

    #[test]
    fn existing_file_is_reported_as_file_origin() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("arkive.toml");
        std::fs::write(&path, "[Globals]\nDbType = \"hsql\"\n").expect("should write config");
        let config = load_config(path.to_str()).expect("config should load");
        assert_eq!(config.origin, ConfigOrigin::File);
        assert_eq!(config.globals.get("Globals.DbType").map(String::as_str), Some("hsql"));
    }
}
