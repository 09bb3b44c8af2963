use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resilience::retry::FixedRetry;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Unix domain socket path. When set, it replaces the TCP listener.
    pub uds: Option<String>,
    /// Maximum size of a single client frame in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            uds: None,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Broker URL. Empty disables server push entirely.
    pub url: String,
    pub events_channel: String,
    pub editor_channel: String,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            events_channel: "events".to_string(),
            editor_channel: "open_in_editor".to_string(),
            connect_attempts: 10,
            connect_retry_delay_ms: 1000,
            timeout_seconds: 5,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn connect_retry(&self) -> FixedRetry {
        FixedRetry::new(
            self.connect_attempts,
            Duration::from_millis(self.connect_retry_delay_ms),
        )
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Backend web application that owns sessions and permissions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Where the relay accepts client connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Unix(PathBuf),
    Tcp(String),
}

impl std::fmt::Display for ListenTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "ws://{addr}"),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // REALTIME_SERVER__PORT, REALTIME_REDIS__URL, ...
        builder = builder.add_source(
            Environment::with_prefix("REALTIME")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Listening endpoint. A configured socket path wins over the TCP port.
    #[must_use]
    pub fn listen_target(&self) -> ListenTarget {
        match self.server.uds.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => ListenTarget::Unix(PathBuf::from(path)),
            _ => ListenTarget::Tcp(format!("{}:{}", self.server.host, self.server.port)),
        }
    }

    /// Check for misconfigurations, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if matches!(self.listen_target(), ListenTarget::Tcp(_)) && self.server.port == 0 {
            errors.push("server.port must be non-zero when server.uds is not set".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }

        if self.redis.is_enabled() {
            if let Err(e) = url::Url::parse(&self.redis.url) {
                errors.push(format!("redis.url is invalid: {e}"));
            }
            if self.redis.events_channel.is_empty() {
                errors.push("redis.events_channel must not be empty".to_string());
            }
            if self.redis.editor_channel.is_empty() {
                errors.push("redis.editor_channel must not be empty".to_string());
            }
            if self.redis.connect_attempts == 0 {
                errors.push("redis.connect_attempts must be at least 1".to_string());
            }
        }

        match url::Url::parse(&self.backend.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "backend.url must use http or https, got {}",
                url.scheme()
            )),
            Err(e) => errors.push(format!("backend.url is invalid: {e}")),
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
