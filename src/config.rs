use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::sync::SessionOptions;

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
}

fn default_pull_limit() -> usize {
    100
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server URL (e.g., "http://localhost:8080")
    pub server_url: Option<String>,
    /// User the ID token is issued for
    pub user_id: Option<i64>,
    /// Patches requested per pull
    #[serde(default = "default_pull_limit")]
    pub pull_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            user_id: None,
            pull_limit: default_pull_limit(),
        }
    }
}

impl SyncConfig {
    /// Returns true if sync is configured (has both server_url and user_id)
    pub fn is_configured(&self) -> bool {
        self.server_url.is_some() && self.user_id.is_some()
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the local SQLite store
    pub database_path: ConfigValue<PathBuf>,
    /// Name this device registers under
    pub client_name: ConfigValue<String>,
    /// Snapshot every this many local patches (0 disables)
    pub snapshot_interval: ConfigValue<usize>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Sync configuration
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    client_name: Option<String>,
    snapshot_interval: Option<usize>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("patchsync.db"),
            ConfigSource::Default,
        );
        let mut client_name = ConfigValue::new("patchsync".to_string(), ConfigSource::Default);
        let mut snapshot_interval = ConfigValue::new(100, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(name) = file_config.client_name {
                client_name = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(interval) = file_config.snapshot_interval {
                snapshot_interval = ConfigValue::new(interval, ConfigSource::File);
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("PATCHSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("PATCHSYNC_CLIENT_NAME") {
            client_name = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(interval) = std::env::var("PATCHSYNC_SNAPSHOT_INTERVAL") {
            let interval = interval
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PATCHSYNC_SNAPSHOT_INTERVAL", interval))?;
            snapshot_interval = ConfigValue::new(interval, ConfigSource::Environment);
        }
        // Sync env var overrides
        if let Ok(url) = std::env::var("PATCHSYNC_SYNC_URL") {
            sync.server_url = Some(url);
        }
        if let Ok(user_id) = std::env::var("PATCHSYNC_USER_ID") {
            let parsed = user_id
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("PATCHSYNC_USER_ID", user_id))?;
            sync.user_id = Some(parsed);
        }

        Ok(Self {
            database_path,
            client_name,
            snapshot_interval,
            config_file,
            sync,
        })
    }

    /// Options for sessions opened with this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            client_name: self.client_name.value.clone(),
            snapshot_interval: self.snapshot_interval.value,
            pull_limit: self.sync.pull_limit,
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/patchsync/
    /// - macOS: ~/Library/Application Support/patchsync/
    /// - Windows: %APPDATA%/patchsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patchsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/patchsync/
    /// - macOS: ~/Library/Application Support/patchsync/
    /// - Windows: %APPDATA%/patchsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patchsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidEnv(&'static str, String),
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
            ConfigError::InvalidEnv(name, value) => {
                write!(f, "Invalid value '{}' for {}", value, name)
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
            .contains("patchsync.db"));
        assert_eq!(config.snapshot_interval.value, 100);
        assert_eq!(config.snapshot_interval.source, ConfigSource::Default);
        assert!(config.config_file.is_none());
        assert_eq!(config.sync.pull_limit, 100);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/local.db").unwrap();
        writeln!(file, "client_name: laptop").unwrap();
        writeln!(file, "snapshot_interval: 25").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  server_url: http://localhost:8080").unwrap();
        writeln!(file, "  user_id: 4").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/local.db")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.client_name.value, "laptop");
        assert_eq!(config.snapshot_interval.value, 25);
        assert_eq!(config.config_file, Some(config_path));
        assert!(config.sync.is_configured());
        assert_eq!(config.sync.pull_limit, 100);

        let options = config.session_options();
        assert_eq!(options.client_name, "laptop");
        assert_eq!(options.snapshot_interval, 25);
    }

    #[test]
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "client_name: fromfile").unwrap();

        std::env::set_var("PATCHSYNC_CLIENT_NAME", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.client_name.value, "fromenv");
        assert_eq!(config.client_name.source, ConfigSource::Environment);

        // Clean up
        std::env::remove_var("PATCHSYNC_CLIENT_NAME");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
