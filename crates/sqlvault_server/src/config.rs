//! Server configuration.
//!
//! Settings come from a TOML file, then from environment variables, which
//! win. A missing file means all defaults.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 5432
//!
//! [database]
//! name = "myapp"
//! transaction_mode = "immediate"
//!
//! [storage]
//! backend = "s3"
//! s3 = { bucket = "dbs", region = "eu-west-1", prefix = "prod" }
//!
//! [sync]
//! interval_minutes = 5
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use serde::{Deserialize, Serialize};
use sqlvault_core::{EngineConfig, TransactionMode};
use sqlvault_storage::{validate_name, AzureConfig, S3Config};
use sqlvault_sync::SyncConfig;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// An environment override has the wrong shape.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },

    /// The combined configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Listener and credential settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind.
    pub host: String,
    /// Port to bind. Zero picks a free port.
    pub port: u16,
    /// Accepted user name.
    pub user: String,
    /// Accepted password.
    pub password: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
        }
    }
}

impl std::fmt::Debug for ServerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Working copy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Logical database name.
    pub name: String,
    /// Mode used by a bare `BEGIN`.
    pub transaction_mode: TransactionMode,
    /// Maximum open SQLite connections.
    pub pool_size: usize,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Directory for the working copy. Defaults to the system temp dir.
    pub cache_dir: Option<PathBuf>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            name: "myapp".into(),
            transaction_mode: TransactionMode::Deferred,
            pool_size: 10,
            busy_timeout_ms: 5000,
            cache_dir: None,
        }
    }
}

/// Blob store selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Files under `storage.local.base_path`.
    #[default]
    Local,
    /// Process memory; lost on exit.
    Memory,
    /// Amazon S3 or a compatible service.
    S3,
    /// Azure Blob Storage.
    Azure,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            _ => Err(()),
        }
    }
}

/// Local backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    /// Directory holding the database blobs.
    pub base_path: PathBuf,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
        }
    }
}

/// Storage settings. Only the section for the selected backend is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Selected backend.
    pub backend: Backend,
    /// Local backend.
    pub local: LocalSection,
    /// S3 backend.
    pub s3: S3Config,
    /// Azure backend.
    pub azure: AzureConfig,
}

/// Upload scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Fallback upload interval in minutes.
    pub interval_minutes: u64,
    /// Deadline for one background upload, in seconds.
    pub upload_timeout_secs: u64,
    /// Deadline for the final upload at shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            upload_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// `json` for JSON lines; anything else is plain text.
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl LoggingSection {
    /// Returns true if JSON output was requested.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener and credentials.
    pub server: ServerSection,
    /// Working copy.
    pub database: DatabaseSection,
    /// Blob store.
    pub storage: StorageSection,
    /// Upload scheduling.
    pub sync: SyncSection,
    /// Log output.
    pub logging: LoggingSection,
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

impl ServerConfig {
    /// Reads `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns the TOML error for malformed input or unknown values.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed numbers or names.
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`. Empty values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed numbers or names.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PG_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("PG_PORT") {
            self.server.port = parse("PG_PORT", &v)?;
        }
        if let Some(v) = get("PG_USER") {
            self.server.user = v;
        }
        if let Some(v) = get("PG_PASSWORD") {
            self.server.password = v;
        }
        if let Some(v) = get("DB_NAME") {
            self.database.name = v;
        }
        if let Some(v) = get("TRANSACTION_MODE") {
            self.database.transaction_mode = parse("TRANSACTION_MODE", &v)?;
        }
        if let Some(v) = get("CONNECTION_POOL_SIZE") {
            self.database.pool_size = parse("CONNECTION_POOL_SIZE", &v)?;
        }
        if let Some(v) = get("STORAGE") {
            self.storage.backend = parse("STORAGE", &v)?;
        }
        if let Some(v) = get("LOCAL_BASE_PATH") {
            self.storage.local.base_path = PathBuf::from(v);
        }
        if let Some(v) = get("S3_BUCKET") {
            self.storage.s3.bucket = v;
        }
        if let Some(v) = get("S3_REGION") {
            self.storage.s3.region = Some(v);
        }
        if let Some(v) = get("S3_PREFIX") {
            self.storage.s3.prefix = Some(v);
        }
        if let Some(v) = get("S3_ENDPOINT") {
            self.storage.s3.endpoint = Some(v);
        }
        if let Some(v) = get("AZURE_STORAGE_ACCOUNT") {
            self.storage.azure.account = v;
        }
        if let Some(v) = get("AZURE_STORAGE_CONTAINER") {
            self.storage.azure.container = v;
        }
        if let Some(v) = get("AZURE_STORAGE_KEY") {
            self.storage.azure.key = Some(v);
        }
        if let Some(v) = get("CACHE_TTL_MINUTES") {
            self.sync.interval_minutes = parse("CACHE_TTL_MINUTES", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Checks values that would only fail later at startup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_name(&self.database.name)
            .map_err(|e| ConfigError::Invalid(format!("database.name: {e}")))?;
        if self.database.pool_size == 0 {
            return Err(ConfigError::Invalid("database.pool_size must be at least 1".into()));
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid("server.host is empty".into()));
        }
        match self.storage.backend {
            Backend::S3 if self.storage.s3.bucket.trim().is_empty() => {
                Err(ConfigError::Invalid("storage.s3.bucket is required".into()))
            }
            Backend::Azure if self.storage.azure.account.trim().is_empty() => {
                Err(ConfigError::Invalid("storage.azure.account is required".into()))
            }
            _ => Ok(()),
        }
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Returns the directory for the working copy.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.database
            .cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Builds the engine settings.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .pool_size(self.database.pool_size)
            .busy_timeout(Duration::from_millis(self.database.busy_timeout_ms))
    }

    /// Returns the fallback sync interval.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_minutes.saturating_mul(60))
    }

    /// Builds the sync engine settings.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::new()
            .with_sync_interval(self.sync_interval())
            .with_upload_timeout(Duration::from_secs(self.sync.upload_timeout_secs))
            .with_shutdown_timeout(self.shutdown_timeout())
    }

    /// Returns the deadline for the final upload.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:5432");
        assert_eq!(config.server.user, "postgres");
        assert_eq!(config.database.name, "myapp");
        assert_eq!(config.database.transaction_mode, TransactionMode::Deferred);
        assert_eq!(config.database.pool_size, 10);
        assert_eq!(config.storage.backend, Backend::Local);
        assert_eq!(config.storage.local.base_path, PathBuf::from("./data"));
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
        assert!(!config.logging.is_json());
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sqlvault.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            port = 6543

            [database]
            transaction_mode = "immediate"

            [storage]
            backend = "s3"
            s3 = { bucket = "dbs", prefix = "prod", force_path_style = true }

            [logging]
            format = "JSON"
            "#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 6543);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.transaction_mode, TransactionMode::Immediate);
        assert_eq!(config.storage.backend, Backend::S3);
        assert_eq!(config.storage.s3.bucket, "dbs");
        assert!(config.storage.s3.force_path_style);
        assert!(config.logging.is_json());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[storage]\nbackend = \"tape\"\n").unwrap();
        assert!(matches!(
            ServerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = ServerConfig::default();
        config
            .apply_env_with(env(&[
                ("PG_PORT", "15432"),
                ("PG_PASSWORD", "secret"),
                ("DB_NAME", "orders"),
                ("STORAGE", "Azure"),
                ("AZURE_STORAGE_ACCOUNT", "acct"),
                ("AZURE_STORAGE_CONTAINER", "dbs"),
                ("AZURE_STORAGE_KEY", "a2V5"),
                ("CONNECTION_POOL_SIZE", "4"),
                ("CACHE_TTL_MINUTES", "1"),
                ("LOG_LEVEL", "debug"),
                ("PG_HOST", ""),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 15432);
        assert_eq!(config.server.password, "secret");
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.database.name, "orders");
        assert_eq!(config.database.pool_size, 4);
        assert_eq!(config.storage.backend, Backend::Azure);
        assert_eq!(config.storage.azure.key.as_deref(), Some("a2V5"));
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_with(env(&[("PG_PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PG_PORT", .. }));

        let err = config
            .apply_env_with(env(&[("STORAGE", "tape")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "STORAGE", .. }));
    }

    #[test]
    fn validation() {
        let mut config = ServerConfig::default();
        config.database.name = "../escape".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.storage.backend = Backend::S3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn password_is_not_logged() {
        let mut config = ServerConfig::default();
        config.server.password = "hunter2".into();
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn derived_settings() {
        let mut config = ServerConfig::default();
        config.database.pool_size = 3;
        config.sync.shutdown_timeout_secs = 7;
        assert_eq!(config.engine_config().pool_size, 3);
        assert_eq!(config.sync_config().shutdown_timeout, Duration::from_secs(7));
    }
}
