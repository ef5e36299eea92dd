//! Server configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid config:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/tessera"
//!
//! [rate_limit]
//! per_second = 50
//! per_minute = 1200
//!
//! [relay]
//! hub_bind = "0.0.0.0:9191"
//!
//! [[users]]
//! token = "secret"
//! user = "alice"
//! write = ["*"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auth::UserEntry;
use crate::rate_limit::RateLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Cross-instance relay settings. With neither field set the server runs
/// standalone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Run a relay hub on this address in-process.
    pub hub_bind: Option<String>,
    /// Join the hub at this `ws://` URL.
    pub hub_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Events a slow connection may fall behind before it must resync.
    pub broadcast_capacity: usize,
    /// Changes retained per document for catch-up and transformation.
    pub history_limit: usize,
    pub auth_timeout_ms: u64,
    /// Close a connection after this long without any frame.
    pub idle_timeout_ms: u64,
    /// Clients are expected to heartbeat at this interval.
    pub heartbeat_interval_ms: u64,
    /// Keep an idle document resident this long after its last connection.
    pub grace_period_ms: u64,
    pub autosave_interval_ms: u64,
    pub max_message_bytes: usize,
    pub typing_timeout_ms: u64,
    pub presence_idle_ms: u64,
    pub rate_limit: RateLimits,
    /// RocksDB directory; in-memory storage when unset.
    pub storage_path: Option<PathBuf>,
    pub relay: RelayConfig,
    pub users: Vec<UserEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            history_limit: 1000,
            auth_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            grace_period_ms: 30_000,
            autosave_interval_ms: 5_000,
            max_message_bytes: 1024 * 1024,
            typing_timeout_ms: 3_000,
            presence_idle_ms: 60_000,
            rate_limit: RateLimits::default(),
            storage_path: None,
            relay: RelayConfig::default(),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("broadcast_capacity", self.broadcast_capacity),
            ("history_limit", self.history_limit),
            ("max_message_bytes", self.max_message_bytes),
            ("rate_limit.per_second", self.rate_limit.per_second),
            ("rate_limit.per_minute", self.rate_limit.per_minute),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        if self.heartbeat_interval_ms >= self.idle_timeout_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be shorter than idle_timeout_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn presence_idle(&self) -> Duration {
        Duration::from_millis(self.presence_idle_ms)
    }
}
