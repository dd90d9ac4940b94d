//! Configuration loading from file and environment variables.

use std::path::{Path, PathBuf};

use seeker_db::{
    DbRuntimeSettings, MigrationSettings, DEFAULT_MIGRATIONS_DIR, DEFAULT_MIGRATIONS_TABLE,
};
use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Migration script settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long to wait for a free connection, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Migration script configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding the migration scripts.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,

    /// Name of the tracking table.
    #[serde(default = "default_migrations_table")]
    pub table: String,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "seeker_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "seeker.db".to_string()
}

fn default_pool_size() -> u32 {
    DbRuntimeSettings::default().pool_size
}

fn default_acquire_timeout_ms() -> u64 {
    DbRuntimeSettings::default().acquire_timeout_ms
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MIGRATIONS_DIR)
}

fn default_migrations_table() -> String {
    DEFAULT_MIGRATIONS_TABLE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            table: default_migrations_table(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    /// Pool settings for [`seeker_db::create_pool`].
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_size: self.pool_size,
            acquire_timeout_ms: self.acquire_timeout_ms,
        }
    }
}

impl MigrationsConfig {
    /// Settings for [`seeker_db::MigrationManager::new`].
    pub fn settings(&self) -> MigrationSettings {
        MigrationSettings {
            dir: self.dir.clone(),
            table: self.table.clone(),
        }
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
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SEEKER_DB_PATH` overrides `database.path`
/// - `SEEKER_DB_POOL_SIZE` overrides `database.pool_size`
/// - `SEEKER_DB_ACQUIRE_TIMEOUT_MS` overrides `database.acquire_timeout_ms`
/// - `SEEKER_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `SEEKER_MIGRATIONS_DIR` overrides `migrations.dir`
/// - `SEEKER_MIGRATIONS_TABLE` overrides `migrations.table`
/// - `SEEKER_LOG_LEVEL` overrides `logging.level`
/// - `SEEKER_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an explicit environment lookup.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_with<F>(path: Option<&Path>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %p.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(db_path) = env("SEEKER_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(size) = env("SEEKER_DB_POOL_SIZE") {
        if let Ok(parsed) = size.parse() {
            config.database.pool_size = parsed;
        }
    }
    if let Some(timeout) = env("SEEKER_DB_ACQUIRE_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.database.acquire_timeout_ms = parsed;
        }
    }
    if let Some(timeout) = env("SEEKER_DB_BUSY_TIMEOUT_MS") {
        if let Ok(parsed) = timeout.parse() {
            config.database.busy_timeout_ms = parsed;
        }
    }
    if let Some(dir) = env("SEEKER_MIGRATIONS_DIR") {
        config.migrations.dir = PathBuf::from(dir);
    }
    if let Some(table) = env("SEEKER_MIGRATIONS_TABLE") {
        config.migrations.table = table;
    }
    if let Some(level) = env("SEEKER_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env("SEEKER_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_a_file() {
        let config = load_config_with(None, no_env).expect("defaults load");

        assert_eq!(config.database.path, "seeker.db");
        assert_eq!(config.database.pool_size, 5);
        assert_eq!(config.migrations.dir, PathBuf::from("migrations"));
        assert_eq!(config.migrations.table, "schema_migrations");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = load_config_with(Some(&dir.path().join("absent.toml")), no_env)
            .expect("missing file is not an error");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("seeker.toml");
        std::fs::write(
            &path,
            "[database]\npath = \"/var/lib/seeker/app.db\"\npool_size = 8\n\n[migrations]\ndir = \"db/migrations\"\n",
        )
        .expect("write config");

        let config = load_config_with(Some(&path), no_env).expect("config parses");

        assert_eq!(config.database.path, "/var/lib/seeker/app.db");
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.migrations.dir, PathBuf::from("db/migrations"));
        assert_eq!(config.migrations.table, "schema_migrations");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("seeker.toml");
        std::fs::write(&path, "[database\npath = 3").expect("write config");

        let err = load_config_with(Some(&path), no_env).expect_err("broken toml");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SEEKER_DB_PATH", "/tmp/override.db"),
            ("SEEKER_DB_POOL_SIZE", "12"),
            ("SEEKER_DB_ACQUIRE_TIMEOUT_MS", "not-a-number"),
            ("SEEKER_MIGRATIONS_TABLE", "app_migrations"),
            ("SEEKER_LOG_JSON", "1"),
        ]);

        let config = load_config_with(None, |key| env.get(key).map(|v| v.to_string()))
            .expect("config loads");

        assert_eq!(config.database.path, "/tmp/override.db");
        assert_eq!(config.database.pool_size, 12);
        assert_eq!(
            config.database.acquire_timeout_ms, 30_000,
            "unparseable override is ignored"
        );
        assert_eq!(config.migrations.table, "app_migrations");
        assert!(config.logging.json);
    }

    #[test]
    fn runtime_settings_mirror_database_section() {
        let config = DatabaseConfig {
            path: "x.db".to_string(),
            pool_size: 2,
            acquire_timeout_ms: 250,
            busy_timeout_ms: 100,
        };

        assert_eq!(
            config.runtime_settings(),
            DbRuntimeSettings {
                busy_timeout_ms: 100,
                pool_size: 2,
                acquire_timeout_ms: 250,
            }
        );
    }
}
