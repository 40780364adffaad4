//! Daemon configuration.
//!
//! Resolution order: built-in defaults, then the optional TOML file, then
//! environment overrides, then validation.
//!
//! ```toml
//! listen = "0.0.0.0:8000"
//!
//! [store]
//! backend = "keydb"
//! endpoint = "redis://127.0.0.1:6379"
//!
//! [channels]
//! broadcast_channel = "ws_example_channel"
//! user_channel_template = "ws_example_user_channel_{}"
//!
//! [push]
//! enabled = true
//! interval_secs = 5
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::{ChannelKind, ChannelName, DEFAULT_BROADCAST_CHANNEL, DEFAULT_USER_CHANNEL_TEMPLATE};
use serde::Deserialize;
use thiserror::Error;

/// Overrides `listen`.
pub const ENV_LISTEN: &str = "RELAY_LISTEN";

/// Overrides `store.endpoint`.
pub const ENV_STORE_URL: &str = "RELAY_STORE_URL";

/// Overrides `store.backend`.
pub const ENV_STORE_BACKEND: &str = "RELAY_STORE_BACKEND";

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub push: PushConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            store: StoreConfig::default(),
            channels: ChannelsConfig::default(),
            session: SessionConfig::default(),
            lock: LockConfig::default(),
            push: PushConfig::default(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl RelayConfig {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| ConfigError::Invalid {
            field: "listen",
            message: format!("'{}' is not a socket address", self.listen),
        })
    }

    /// Channel kind used by `/ws` connections.
    pub fn broadcast_kind(&self) -> ChannelKind {
        ChannelKind::broadcast(self.channels.broadcast_channel.as_str())
    }

    /// Channel kind used by `/ws/{user_id}` connections.
    pub fn per_user_kind(&self) -> Result<ChannelKind, ConfigError> {
        ChannelKind::per_identity(self.channels.user_channel_template.as_str()).map_err(|e| {
            ConfigError::Invalid {
                field: "channels.user_channel_template",
                message: e.to_string(),
            }
        })
    }

    /// Channel the push job publishes to.
    pub fn push_channel(&self) -> ChannelName {
        match &self.push.channel {
            Some(channel) => ChannelName::new(channel.as_str()),
            None => ChannelName::new(self.channels.broadcast_channel.as_str()),
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(ENV_LISTEN) {
            self.listen = listen;
        }
        if let Some(endpoint) = lookup(ENV_STORE_URL) {
            self.store.endpoint = endpoint;
        }
        if let Some(backend) = lookup(ENV_STORE_BACKEND) {
            self.store.backend = backend.parse()?;
        }
        Ok(())
    }

    /// Sanity checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if self.store.backend == StoreBackend::Keydb && self.store.endpoint.trim().is_empty() {
            return Err(invalid("store.endpoint", "required for the keydb backend"));
        }
        if self.store.pool_size == 0 {
            return Err(invalid("store.pool_size", "must be at least 1"));
        }
        if self.channels.broadcast_channel.trim().is_empty() {
            return Err(invalid("channels.broadcast_channel", "must not be empty"));
        }
        self.per_user_kind()?;
        if self.session.max_message_size == 0 {
            return Err(invalid("session.max_message_size", "must be at least 1"));
        }
        if self.session.write_timeout_ms == 0 {
            return Err(invalid("session.write_timeout_ms", "must be at least 1"));
        }
        if self.lock.default_ttl_secs == 0 {
            return Err(invalid("lock.default_ttl_secs", "must be at least 1"));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(invalid("lock.poll_interval_ms", "must be at least 1"));
        }
        if self.push.enabled && self.push.interval_secs == 0 {
            return Err(invalid("push.interval_secs", "must be at least 1"));
        }
        if self.push.channel.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(invalid("push.channel", "must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Which shared store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// KeyDB or Redis, shared by every relay process
    #[default]
    Keydb,
    /// Process-local; broadcasts stay inside this process
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keydb" | "redis" => Ok(Self::Keydb),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Invalid {
                field: "store.backend",
                message: format!("unknown backend '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection string (e.g. `redis://127.0.0.1:6379`).
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    /// Enable TLS for the store connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable holding the store password.
    #[serde(default = "default_auth_token_env")]
    pub auth_token_env: String,
    /// Number of pooled command connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint: default_store_endpoint(),
            tls: false,
            auth_token_env: default_auth_token_env(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_store_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_auth_token_env() -> String {
    "RELAY_STORE_PASSWORD".to_string()
}

fn default_pool_size() -> usize {
    4
}

// ============================================================================
// Channels / session
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Channel every `/ws` connection joins.
    #[serde(default = "default_broadcast_channel")]
    pub broadcast_channel: String,
    /// Template with one `{}` placeholder for the user id.
    #[serde(default = "default_user_channel_template")]
    pub user_channel_template: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            broadcast_channel: default_broadcast_channel(),
            user_channel_template: default_user_channel_template(),
        }
    }
}

fn default_broadcast_channel() -> String {
    DEFAULT_BROADCAST_CHANNEL.to_string()
}

fn default_user_channel_template() -> String {
    DEFAULT_USER_CHANNEL_TEMPLATE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Inbound text frames larger than this many bytes are dropped.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Per-write timeout on client sockets.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl SessionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_max_message_size() -> usize {
    64 * 1024
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

// ============================================================================
// Lock / push
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_lock_ttl(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_lock_ttl() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_push_interval")]
    pub interval_secs: u64,
    /// Target channel; defaults to `channels.broadcast_channel`.
    #[serde(default)]
    pub channel: Option<String>,
}

impl PushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_push_interval(),
            channel: None,
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_push_interval() -> u64 {
    5
}

// ============================================================================
// Loader
// ============================================================================

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Loads configuration from `path` (if any), applies env overrides and
/// validates the result.
pub fn load(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => from_file(path)?,
        None => RelayConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn from_file(path: &Path) -> Result<RelayConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.backend, StoreBackend::Keydb);
        assert_eq!(config.lock.default_ttl(), Duration::from_secs(10));
        assert_eq!(config.lock.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.push.interval(), Duration::from_secs(5));
        assert_eq!(config.push_channel().as_str(), DEFAULT_BROADCAST_CHANNEL);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen = "127.0.0.1:9000"

[store]
backend = "memory"

[channels]
broadcast_channel = "lobby"
user_channel_template = "user:{{}}"

[push]
enabled = false
"#
        )
        .unwrap();

        let config = from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.channels.broadcast_channel, "lobby");
        assert!(!config.push.enabled);
        assert_eq!(
            config
                .per_user_kind()
                .unwrap()
                .channel_for(Some("7"))
                .unwrap()
                .as_str(),
            "user:7"
        );
    }

    #[test]
    fn test_unknown_field_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listne = \"127.0.0.1:9000\"").unwrap();
        assert!(matches!(from_file(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("relay.toml");
        assert!(matches!(from_file(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LISTEN, "127.0.0.1:7000"),
            (ENV_STORE_URL, "redis://keydb:6380"),
            (ENV_STORE_BACKEND, "memory"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.store.endpoint, "redis://keydb:6380");
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.channels.user_channel_template = "no-placeholder".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "channels.user_channel_template", .. })
        ));

        let mut config = RelayConfig::default();
        config.listen = "not an address".into();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.lock.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("Redis".parse::<StoreBackend>().unwrap(), StoreBackend::Keydb);
        assert!("etcd".parse::<StoreBackend>().is_err());
    }
}
