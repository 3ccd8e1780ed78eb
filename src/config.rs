//! Configuration management for livestate
//!
//! Handles loading and parsing of the YAML configuration file: server
//! binding, sync behavior and the initial shape of the shared state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::fs;

use crate::api::{DEFAULT_API_PORT, DEFAULT_WS_PATH};
use crate::bridge::SyncOptions;
use crate::error::ConfigError;
use crate::state::Snapshot;

/// Default config file looked up when none is given
pub const DEFAULT_CONFIG_PATH: &str = "livestate.yaml";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Initial state; its top-level keys are the state fields
    #[serde(default)]
    pub initial_state: Value,
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

/// Replication behavior
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Send the full snapshot to each client right after it connects
    #[serde(default)]
    pub sync_on_connect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_yaml_str(&content, &path.display().to_string())
    }

    /// Parse and validate configuration text; `origin` names it in errors
    pub fn from_yaml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: origin.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.initial_state, Value::Object(_) | Value::Null) {
            return Err(ConfigError::InitialStateNotMapping);
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath {
                path: self.server.ws_path.clone(),
            });
        }
        Ok(())
    }

    /// Initial snapshot; an absent `initial_state` gives an empty state
    pub fn initial_snapshot(&self) -> Snapshot {
        match &self.initial_state {
            Value::Object(map) => map.clone(),
            _ => Snapshot::new(),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            sync_on_connect: self.sync.sync_on_connect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9000
  ws_path: /sync
sync:
  sync_on_connect: true
initial_state:
  count: 0
  tags: [a]
  prefs:
    theme: dark
  active: false
"#;
        let config = AppConfig::from_yaml_str(yaml, "inline").unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.ws_path, "/sync");
        assert!(config.sync_options().sync_on_connect);

        let snapshot = config.initial_snapshot();
        assert_eq!(
            snapshot.keys().collect::<Vec<_>>(),
            vec!["count", "tags", "prefs", "active"]
        );
        assert_eq!(snapshot["tags"], json!(["a"]));
        assert_eq!(snapshot["prefs"], json!({"theme": "dark"}));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_yaml_str("initial_state:\n  count: 1\n", "inline").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, DEFAULT_API_PORT);
        assert_eq!(config.server.ws_path, DEFAULT_WS_PATH);
        assert!(!config.sync.sync_on_connect);

        let empty = AppConfig::from_yaml_str("{}", "inline").unwrap();
        assert!(empty.initial_snapshot().is_empty());
    }

    #[test]
    fn test_initial_state_must_be_mapping() {
        let err = AppConfig::from_yaml_str("initial_state: [1, 2]\n", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::InitialStateNotMapping));
    }

    #[test]
    fn test_ws_path_must_be_absolute() {
        let err = AppConfig::from_yaml_str("server:\n  ws_path: ws\n", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWsPath { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("livestate.yaml");
        std::fs::write(&config_path, "initial_state:\n  active: true\n").unwrap();

        let config = AppConfig::load(&config_path).await.unwrap();
        assert_eq!(config.initial_snapshot()["active"], json!(true));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = AppConfig::load(temp_dir.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
