//! Configuration file parsing
//!
//! Reads `migrate.toml`. Every section and key is optional; command-line
//! flags override what the file says.

use crate::dialect::DialectKind;
use crate::history::DEFAULT_HISTORY_TABLE;
use crate::lock::DEFAULT_LOCK_TABLE;
use crate::output::OutputFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub migrations: MigrationsConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    /// Directory holding `<id>.toml` migration files
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,

    /// Ledger table name
    #[serde(default = "default_history_table")]
    pub history_table: String,

    /// Advisory lock table name
    #[serde(default = "default_lock_table")]
    pub lock_table: String,

    /// Apply pending migrations older than the newest applied one
    #[serde(default)]
    pub allow_out_of_order: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            history_table: default_history_table(),
            lock_table: default_lock_table(),
            allow_out_of_order: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub dialect: DialectKind,

    /// Database file (SQLite)
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long to wait on a locked database before failing a statement
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dialect: DialectKind::default(),
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset, e.g. "info" or "schema_migrate=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_history_table() -> String {
    DEFAULT_HISTORY_TABLE.to_string()
}

fn default_lock_table() -> String {
    DEFAULT_LOCK_TABLE.to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("app.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "warn".to_string()
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, table) in [
            ("migrations.history_table", &self.migrations.history_table),
            ("migrations.lock_table", &self.migrations.lock_table),
        ] {
            if !is_identifier(table) {
                return Err(ConfigError::Validation(format!(
                    "{key} '{table}' must be a plain identifier (letters, digits, underscores)"
                )));
            }
        }
        if self.migrations.history_table == self.migrations.lock_table {
            return Err(ConfigError::Validation(
                "migrations.history_table and migrations.lock_table must differ".to_string(),
            ));
        }
        if self.database.busy_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "database.busy_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // A bare level is checked here; full filter directives are left to
        // the subscriber.
        let level = self.logging.level.trim();
        if !level.contains(['=', ',']) && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid logging.level '{}'. Valid values: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
