//! Configuration management for the chat hub.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for storing data
    pub data_dir: PathBuf,

    /// Path to SQLite database
    pub db_path: PathBuf,

    /// Path to config directory
    pub config_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Address to bind the HTTP server to
    pub host: String,

    /// HTTP port for web server
    pub http_port: u16,

    /// Per-client outbound queue size; a client whose queue fills up is dropped
    pub queue_capacity: usize,

    /// Pending broadcasts the hub accepts before submitters wait
    pub broadcast_buffer: usize,

    /// Idle seconds before a stream emits a keep-alive comment
    pub keepalive_secs: u64,

    /// Messages returned to a client joining the room
    pub history_limit: usize,

    /// Delete messages older than this many days (disabled when unset)
    pub retention_days: Option<u32>,

    /// Seconds between retention sweeps
    pub purge_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("chat-hub");
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home.join(".config"))
            .join("chat-hub");

        Self {
            db_path: data_dir.join("chat.db"),
            config_dir,
            data_dir,
            log_level: "info".to_string(),
            host: "127.0.0.1".to_string(),
            http_port: 8082,
            queue_capacity: 256,
            broadcast_buffer: 256,
            keepalive_secs: 30,
            history_limit: 50,
            retention_days: None,
            purge_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` if given, otherwise from the default location if a
    /// file exists there, otherwise defaults.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = Self::default().config_file();
        if default_path.exists() {
            Self::load(&default_path.to_string_lossy())
        } else {
            Ok(Self::default())
        }
    }

    /// Default location of the config file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Ensure all directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.config_dir)?;
        Ok(())
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.keepalive(), Duration::from_secs(30));
        assert_eq!(config.history_limit, 50);
        assert!(config.retention_days.is_none());
        assert!(config.db_path.ends_with("chat.db"));
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"http_port": 9000, "retention_days": 7}"#).unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.retention_days, Some(7));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.keepalive_secs = 5;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = Config::resolve(path.to_str()).unwrap();
        assert_eq!(loaded.keepalive_secs, 5);
    }
}
