//! Runtime Configuration
//!
//! `DalConfig` selects the backend and carries the settings of every layer.
//! It is read from a TOML file (all keys optional) and then overlaid with
//! `UNISTORE_*` environment variables:
//!
//! ```toml
//! backend = "relational"
//!
//! [relational]
//! path = "data/unistore.db"
//! pool_max = 10
//! slow_query_ms = 500
//!
//! [document]
//! url = "rocksdb://data/unistore"
//!
//! [search]
//! url = "http://127.0.0.1:7700"
//! api_key = "masterKey"
//! ```

use crate::db::{
    BackendKind, LibsqlConfig, MigrationSource, PoolOptions, PoolTarget, SurrealConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Top-level data access layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DalConfig {
    /// `relational` (aliases `libsql`, `turso`, `sqlite`) or `document` (alias `surrealdb`)
    pub backend: String,
    pub relational: RelationalSettings,
    pub document: DocumentSettings,
    pub search: SearchConfig,
    pub monitor: MonitorSettings,
}

impl Default for DalConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Relational.as_str().to_string(),
            relational: RelationalSettings::default(),
            document: DocumentSettings::default(),
            search: SearchConfig::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

/// libsql / Turso settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalSettings {
    /// Local database file, or `:memory:`
    pub path: String,
    /// Remote endpoint; takes precedence over `path` when set
    pub url: Option<String>,
    pub auth_token: Option<String>,
    pub pool_min: usize,
    pub pool_max: usize,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub busy_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub slow_query_ms: u64,
    pub metrics_window: usize,
    pub metrics_reset_secs: u64,
    pub auto_migrate: bool,
    pub migrations_dir: Option<PathBuf>,
}

impl Default for RelationalSettings {
    fn default() -> Self {
        let pool = PoolOptions::default();
        Self {
            path: "data/unistore.db".to_string(),
            url: None,
            auth_token: None,
            pool_min: pool.min_size,
            pool_max: pool.max_size,
            idle_timeout_secs: pool.idle_timeout.as_secs(),
            acquire_timeout_ms: pool.acquire_timeout.as_millis() as u64,
            keep_alive_secs: pool.keep_alive_interval.as_secs(),
            busy_timeout_ms: pool.busy_timeout.as_millis() as u64,
            query_timeout_ms: 30_000,
            slow_query_ms: 500,
            metrics_window: 1000,
            metrics_reset_secs: 3600,
            auto_migrate: true,
            migrations_dir: None,
        }
    }
}

/// SurrealDB settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        let defaults = SurrealConfig::new("rocksdb://data/unistore");
        Self {
            url: defaults.url,
            namespace: defaults.namespace,
            database: defaults.database,
            username: None,
            password: None,
        }
    }
}

/// Meilisearch settings; search is disabled without a URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    /// Documents per batch during `sync_collection`
    pub batch_size: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            api_key: None,
            timeout_ms: 5_000,
            batch_size: 100,
        }
    }
}

impl SearchConfig {
    /// Whether a search engine should be contacted at all
    pub fn is_active(&self) -> bool {
        self.enabled && self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl DalConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay values from `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup("UNISTORE_BACKEND") {
            self.backend = backend;
        }

        if let Some(path) = lookup("UNISTORE_LIBSQL_PATH") {
            self.relational.path = path;
        }
        if let Some(url) = lookup("UNISTORE_LIBSQL_URL") {
            self.relational.url = Some(url);
        }
        if let Some(token) = lookup("UNISTORE_LIBSQL_AUTH_TOKEN") {
            self.relational.auth_token = Some(token);
        }
        if let Some(value) = lookup("UNISTORE_LIBSQL_POOL_MAX") {
            self.relational.pool_max = parse_env("UNISTORE_LIBSQL_POOL_MAX", &value)?;
        }
        if let Some(value) = lookup("UNISTORE_AUTO_MIGRATE") {
            self.relational.auto_migrate = parse_env("UNISTORE_AUTO_MIGRATE", &value)?;
        }

        if let Some(url) = lookup("UNISTORE_SURREAL_URL") {
            self.document.url = url;
        }
        if let Some(ns) = lookup("UNISTORE_SURREAL_NAMESPACE") {
            self.document.namespace = ns;
        }
        if let Some(db) = lookup("UNISTORE_SURREAL_DATABASE") {
            self.document.database = db;
        }
        if let Some(user) = lookup("UNISTORE_SURREAL_USERNAME") {
            self.document.username = Some(user);
        }
        if let Some(pass) = lookup("UNISTORE_SURREAL_PASSWORD") {
            self.document.password = Some(pass);
        }

        if let Some(url) = lookup("UNISTORE_SEARCH_URL") {
            self.search.url = Some(url);
        }
        if let Some(key) = lookup("UNISTORE_SEARCH_API_KEY") {
            self.search.api_key = Some(key);
        }
        if let Some(value) = lookup("UNISTORE_SEARCH_ENABLED") {
            self.search.enabled = parse_env("UNISTORE_SEARCH_ENABLED", &value)?;
        }

        if let Some(value) = lookup("UNISTORE_HEALTH_INTERVAL_SECS") {
            self.monitor.interval_secs = parse_env("UNISTORE_HEALTH_INTERVAL_SECS", &value)?;
        }
        Ok(())
    }

    /// Reject settings no backend could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend_kind()?;
        if self.relational.pool_max == 0 {
            return Err(ConfigError::invalid("relational.pool_max", "must be at least 1"));
        }
        if self.relational.pool_min > self.relational.pool_max {
            return Err(ConfigError::invalid(
                "relational.pool_min",
                "must not exceed relational.pool_max",
            ));
        }
        if self.relational.url.is_some() && self.relational.auth_token.is_none() {
            return Err(ConfigError::invalid(
                "relational.auth_token",
                "required when relational.url is set",
            ));
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::invalid("monitor.interval_secs", "must be positive"));
        }
        if self.search.batch_size == 0 {
            return Err(ConfigError::invalid("search.batch_size", "must be positive"));
        }
        Ok(())
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        self.backend
            .parse()
            .map_err(|e: crate::db::StoreError| ConfigError::invalid("backend", e.to_string()))
    }

    /// Relational adapter settings derived from this config
    pub fn libsql_config(&self) -> LibsqlConfig {
        let r = &self.relational;
        let target = match (&r.url, &r.auth_token) {
            (Some(url), Some(token)) => PoolTarget::Remote {
                url: url.clone(),
                auth_token: token.clone(),
            },
            _ => PoolTarget::Local(r.path.clone()),
        };
        LibsqlConfig {
            target,
            pool: PoolOptions {
                min_size: r.pool_min,
                max_size: r.pool_max,
                idle_timeout: Duration::from_secs(r.idle_timeout_secs),
                acquire_timeout: Duration::from_millis(r.acquire_timeout_ms),
                keep_alive_interval: Duration::from_secs(r.keep_alive_secs),
                busy_timeout: Duration::from_millis(r.busy_timeout_ms),
            },
            query_timeout: Duration::from_millis(r.query_timeout_ms),
            slow_query_threshold: Duration::from_millis(r.slow_query_ms),
            metrics_window: r.metrics_window,
            metrics_reset_interval: Duration::from_secs(r.metrics_reset_secs),
            auto_migrate: r.auto_migrate,
            migrations: r
                .migrations_dir
                .clone()
                .map(MigrationSource::Directory)
                .unwrap_or_default(),
        }
    }

    /// Document adapter settings derived from this config
    pub fn surreal_config(&self) -> SurrealConfig {
        let d = &self.document;
        SurrealConfig {
            url: d.url.clone(),
            namespace: d.namespace.clone(),
            database: d.database.clone(),
            username: d.username.clone(),
            password: d.password.clone(),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = DalConfig::from_toml("").unwrap();
        assert_eq!(config, DalConfig::default());
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Relational);
        assert!(!config.search.is_active());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = DalConfig::from_toml(
            r#"
            backend = "surrealdb"

            [relational]
            pool_max = 4

            [search]
            url = "http://localhost:7700"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend_kind().unwrap(), BackendKind::Document);
        assert_eq!(config.relational.pool_max, 4);
        assert_eq!(config.relational.slow_query_ms, 500);
        assert!(config.search.is_active());
        assert_eq!(config.libsql_config().pool.max_size, 4);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("UNISTORE_BACKEND", "document"),
            ("UNISTORE_SURREAL_URL", "mem://"),
            ("UNISTORE_SEARCH_URL", "http://search:7700"),
            ("UNISTORE_SEARCH_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = DalConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend_kind().unwrap(), BackendKind::Document);
        assert_eq!(config.surreal_config().url, "mem://");
        assert_eq!(config.search.api_key.as_deref(), Some("secret"));
        assert!(config.search.is_active());
    }

    #[test]
    fn test_invalid_env_number_is_reported() {
        let mut config = DalConfig::default();
        let err = config
            .apply_env(|key| (key == "UNISTORE_LIBSQL_POOL_MAX").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_rejects_unknown_backend_and_remote_without_token() {
        let mut config = DalConfig {
            backend: "oracle".to_string(),
            ..DalConfig::default()
        };
        assert!(config.validate().is_err());

        config.backend = "turso".to_string();
        config.relational.url = Some("libsql://db.example.turso.io".to_string());
        assert!(config.validate().is_err());

        config.relational.auth_token = Some("token".to_string());
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.libsql_config().target,
            PoolTarget::Remote { .. }
        ));
    }

    #[test]
    fn test_migrations_default_to_bundled_scripts() {
        let config = DalConfig::default();
        assert_eq!(config.libsql_config().migrations, MigrationSource::Bundled);

        let config = DalConfig::from_toml(
            r#"
            [relational]
            migrations_dir = "/srv/unistore/migrations"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.libsql_config().migrations,
            MigrationSource::Directory(PathBuf::from("/srv/unistore/migrations"))
        );
    }
}
