use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tablesync_core::SyncOptions;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    fn set(&mut self, value: Option<T>, source: ConfigSource) {
        if let Some(value) = value {
            *self = Self::new(value, source);
        }
    }
}

/// Remote table service settings
#[derive(Debug, Clone, Serialize)]
pub struct RemoteConfig {
    /// Base URL of the table service (e.g., "http://localhost:8080")
    pub server_url: ConfigValue<String>,
    /// Upper bound for each request, in seconds
    pub request_timeout_secs: ConfigValue<u64>,
    /// Log every HTTP exchange at info level
    pub log_http: ConfigValue<bool>,
    /// Rows fetched per pull request
    pub page_size: ConfigValue<usize>,
}

impl RemoteConfig {
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs.value),
            page_size: self.page_size.value,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite database
    pub database_path: ConfigValue<PathBuf>,
    /// Table used when a command is given no `--table`
    pub table: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub remote: RemoteConfig,
}

/// Internal structs for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    table: Option<String>,
    remote: RemoteFile,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RemoteFile {
    server_url: Option<String>,
    request_timeout_secs: Option<u64>,
    log_http: Option<bool>,
    page_size: Option<usize>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("tablesync.db"),
            ConfigSource::Default,
        );
        let mut table = ConfigValue::new("items".to_string(), ConfigSource::Default);
        let mut server_url =
            ConfigValue::new("http://localhost:8080".to_string(), ConfigSource::Default);
        let mut request_timeout_secs = ConfigValue::new(30, ConfigSource::Default);
        let mut log_http = ConfigValue::new(false, ConfigSource::Default);
        let mut page_size = ConfigValue::new(50, ConfigSource::Default);
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            // Resolve relative paths against config file's directory
            let db_path = file_config.database_path.map(|db_path| {
                if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                }
            });
            database_path.set(db_path, ConfigSource::File);
            table.set(file_config.table, ConfigSource::File);

            let remote = file_config.remote;
            server_url.set(remote.server_url, ConfigSource::File);
            request_timeout_secs.set(remote.request_timeout_secs, ConfigSource::File);
            log_http.set(remote.log_http, ConfigSource::File);
            page_size.set(remote.page_size, ConfigSource::File);
        }

        // Apply environment variable overrides
        database_path.set(env_var("TABLESYNC_DATABASE_PATH")?, ConfigSource::Environment);
        table.set(env_var("TABLESYNC_TABLE")?, ConfigSource::Environment);
        server_url.set(env_var("TABLESYNC_SERVER_URL")?, ConfigSource::Environment);
        request_timeout_secs.set(
            env_var("TABLESYNC_REQUEST_TIMEOUT_SECS")?,
            ConfigSource::Environment,
        );
        log_http.set(env_var("TABLESYNC_LOG_HTTP")?, ConfigSource::Environment);
        page_size.set(env_var("TABLESYNC_PAGE_SIZE")?, ConfigSource::Environment);

        if page_size.value == 0 {
            return Err(ConfigError::InvalidValue {
                key: "remote.page_size",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_path,
            table,
            config_file,
            remote: RemoteConfig {
                server_url,
                request_timeout_secs,
                log_http,
                page_size,
            },
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/tablesync/
    /// - macOS: ~/Library/Application Support/tablesync/
    /// - Windows: %APPDATA%/tablesync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tablesync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/tablesync/
    /// - macOS: ~/Library/Application Support/tablesync/
    /// - Windows: %APPDATA%/tablesync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tablesync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn env_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: name,
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("tablesync.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.table.value, "items");
        assert_eq!(config.remote.page_size.value, 50);
        assert!(config.config_file.is_none());

        let options = config.remote.sync_options();
        assert_eq!(options.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/db.sqlite").unwrap();
        writeln!(file, "table: todos").unwrap();
        writeln!(file, "remote:").unwrap();
        writeln!(file, "  server_url: http://sync.example.com").unwrap();
        writeln!(file, "  log_http: true").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/db.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.table.value, "todos");
        assert_eq!(config.remote.server_url.value, "http://sync.example.com");
        assert_eq!(config.remote.server_url.source, ConfigSource::File);
        assert!(config.remote.log_http.value);
        assert_eq!(config.remote.page_size.source, ConfigSource::Default);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/local.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/local.db")
        );
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "table: fromfile").unwrap();

        // Set env var
        std::env::set_var("TABLESYNC_TABLE", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.table.value, "fromenv");
        assert_eq!(config.table.source, ConfigSource::Environment);

        // Clean up
        std::env::remove_var("TABLESYNC_TABLE");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "remote:").unwrap();
        writeln!(file, "  page_size: 0").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("remote.page_size"));
    }
}
