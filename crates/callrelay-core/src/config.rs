//! Configuration system for callrelay
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/callrelay/config.toml
//! - Linux: ~/.config/callrelay/config.toml
//! - Windows: %APPDATA%/callrelay/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_SIGNAL_PORT, DEFAULT_STUN_SERVER};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal server settings
    pub signal: SignalConfig,
    /// Client settings
    pub client: ClientConfig,
}

/// Signal server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Database path for the user/message API (None = API disabled)
    pub db_path: Option<PathBuf>,
    /// Largest accepted WebSocket frame or HTTP body
    pub max_message_bytes: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SIGNAL_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the signal server
    pub signal_url: String,
    /// Base URL of the user/message HTTP API
    pub api_url: String,
    /// Candidate-gathering servers handed to new peer connections
    pub ice_servers: Vec<String>,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: format!("ws://localhost:{}", DEFAULT_SIGNAL_PORT),
            api_url: format!("http://localhost:{}", DEFAULT_SIGNAL_PORT),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            request_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "callrelay", "callrelay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values that would only fail later at connect time
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signal.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("signal.max_message_bytes must be positive".into()));
        }
        if !has_scheme(&self.client.signal_url, &["ws://", "wss://"]) {
            return Err(ConfigError::Invalid(format!(
                "client.signal_url must be ws:// or wss://, got {}",
                self.client.signal_url
            )));
        }
        if !has_scheme(&self.client.api_url, &["http://", "https://"]) {
            return Err(ConfigError::Invalid(format!(
                "client.api_url must be http:// or https://, got {}",
                self.client.api_url
            )));
        }
        if let Some(bad) = self
            .client
            .ice_servers
            .iter()
            .find(|s| !has_scheme(s, &["stun:", "stuns:", "turn:", "turns:"]))
        {
            return Err(ConfigError::Invalid(format!("not a STUN/TURN URL: {}", bad)));
        }
        Ok(())
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

fn has_scheme(url: &str, schemes: &[&str]) -> bool {
    schemes
        .iter()
        .any(|scheme| {
            url.len() > scheme.len()
                && url
                    .get(..scheme.len())
                    .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        })
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// A value that cannot work
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signal.port, 8080);
        assert!(config.signal.db_path.is_none());
        assert_eq!(config.client.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.client.signal_url, "ws://localhost:8080");
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [signal]
            port = 9000
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.signal.port, 9000);
        // Other values should be defaults
        assert_eq!(config.signal.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
        assert_eq!(config.client.request_timeout_secs, 30);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.signal.db_path = Some(PathBuf::from("/var/lib/callrelay/signal.db"));
        config.client.ice_servers.push("stun:stun.example.org:3478".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.signal.db_path, config.signal.db_path);
        assert_eq!(loaded.client.ice_servers.len(), 2);
    }

    #[test]
    fn test_invalid_config_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[signal]\nport = \"not a number\"\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.client.signal_url = "http://localhost:8080".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.client.ice_servers = vec!["TURN:turn.example.org".into(), "stun.example.org".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stun.example.org"));

        let mut config = Config::default();
        config.signal.max_message_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[signal]"));
        assert!(sample.contains("[client]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.signal.port, 8080);
    }
}
