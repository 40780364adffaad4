//! Process-local store for single-node deployments and tests.
//!
//! Keys expire against the tokio clock, so a paused test runtime controls
//! lock expiry deterministically. Pub/sub uses one `broadcast` channel per
//! store channel; the number of live receivers is the number of open
//! subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SharedStore, StoreError, Subscription};

/// Per-channel buffer of undelivered messages.
const CHANNEL_BUFFER: usize = 256;

#[derive(Default)]
struct MemoryState {
    /// key -> (value, expires_at)
    keys: HashMap<String, (String, Instant)>,
    /// channel -> publisher side of the feed
    channels: HashMap<String, broadcast::Sender<String>>,
}

impl MemoryState {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let now = Instant::now();
        let expired = self
            .keys
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now);
        if expired {
            self.keys.remove(key);
        }
        self.keys.get(key).map(|(value, _)| value)
    }
}

/// In-memory implementation of [`SharedStore`].
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates the store becoming (un)reachable.
    ///
    /// While unavailable every command fails with `StoreError::Unavailable`.
    /// Open subscriptions stay attached.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of open subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Current unexpired value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().live_value(key).cloned()
    }

    /// Ends every open feed on `channel`, as if the server dropped them.
    pub fn drop_channel(&self, channel: &str) {
        if self.state.lock().channels.remove(channel).is_some() {
            debug!(%channel, "Dropped all subscriptions");
        }
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if state.live_value(key).is_some() {
            return Ok(false);
        }
        state
            .keys
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if state.live_value(key).is_some_and(|value| value == expected) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        self.ensure_available()?;
        let state = self.state.lock();
        if let Some(sender) = state.channels.get(channel) {
            // No receivers is not an error: nobody is listening right now.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        self.ensure_available().map_err(|e| StoreError::Subscribe {
            channel: channel.to_string(),
            message: e.to_string(),
        })?;
        let mut state = self.state.lock();
        let receiver = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .subscribe();
        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            receiver,
            state: Arc::clone(&self.state),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySubscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscription lagged, skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(self: Box<Self>) {
        let Self {
            channel,
            receiver,
            state,
        } = *self;
        drop(receiver);

        let mut state = state.lock();
        let idle = state
            .channels
            .get(&channel)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            state.channels.remove(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_compare_and_delete_matches_value() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", "mine", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert_eq!(store.get("k").as_deref(), Some("mine"));

        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert!(store.get("k").is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("news").await.unwrap();
        assert_eq!(store.subscriber_count("news"), 1);

        store.publish("news", "hello").await.unwrap();
        assert_eq!(sub.next_message().await.as_deref(), Some("hello"));

        sub.close().await;
        assert_eq!(store.subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_commands() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(
            store.set_if_absent("k", "v", Duration::from_secs(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.publish("c", "m").await.is_err());
        assert!(store.subscribe("c").await.is_err());
        assert!(store.ping().await.is_err());

        store.set_available(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_channel_closes_feed() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("c").await.unwrap();
        store.drop_channel("c");
        assert!(sub.next_message().await.is_none());
    }
}
