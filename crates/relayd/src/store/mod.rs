//! Shared key-value / pub-sub store.
//!
//! The daemon only needs a narrow contract from the store: conditional set
//! with expiry, compare-and-delete, publish, and per-channel subscriptions.
//! Two backends implement it:
//!
//! - [`KeyDbStore`] - Redis-compatible server via `fred`, used when several
//!   relay processes share one bus
//! - [`MemoryStore`] - process-local, for single-node deployments and tests
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   set NX PX / CAS-delete   ┌──────────────────┐
//! │ DistributedLock  │───────────────────────────▶│                  │
//! └──────────────────┘                            │   SharedStore    │
//! ┌──────────────────┐   PUBLISH                  │ (KeyDB / memory) │
//! │ ChannelRegistry  │───────────────────────────▶│                  │
//! └──────────────────┘                            └────────┬─────────┘
//! ┌──────────────────┐   SUBSCRIBE feed                    │
//! │   Bridge task    │◀────────────────────────────────────┘
//! └──────────────────┘
//! ```

mod keydb;
mod memory;

pub use keydb::KeyDbStore;
pub use memory::MemoryStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};

/// Lua script: delete `KEYS[1]` only when its value equals `ARGV[1]`.
pub const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Shared handle to a store backend.
pub type StoreRef = Arc<dyn SharedStore>;

/// Operations the relay core requires from the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Sets `key` to `value` with expiry `ttl` only if `key` is absent.
    ///
    /// Returns `true` when the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `true` when a key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Publishes `payload` to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Opens a dedicated feed for `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError>;

    /// Round-trips to the store.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}

/// One open feed of messages published on a single channel.
#[async_trait]
pub trait Subscription: Send {
    /// Channel this feed is attached to.
    fn channel(&self) -> &str;

    /// Waits for the next payload.
    ///
    /// Returns `None` once the feed has closed or failed; the subscription
    /// is unusable afterwards. Must be cancel-safe.
    async fn next_message(&mut self) -> Option<String>;

    /// Unsubscribes and releases the underlying connection.
    async fn close(self: Box<Self>);
}

/// Errors returned by store backends.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store command {op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("Failed to subscribe to channel {channel}: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Invalid store endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },
}

/// Connects the backend selected in configuration.
pub async fn connect(config: &StoreConfig) -> Result<StoreRef, StoreError> {
    match config.backend {
        StoreBackend::Keydb => {
            let store = KeyDbStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; broadcasts will not cross process boundaries");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
