//! The pair of registries a relay process serves.
//!
//! `/ws` connections join the broadcast registry; `/ws/{user_id}`
//! connections join the per-user registry. Server-side producers (HTTP,
//! the broadcast queue, the push job) resolve a [`BroadcastTarget`] here.

use std::sync::Arc;

use relay_core::{ChannelKind, ChannelName};
use relay_protocol::BroadcastTarget;
use serde::Serialize;

use crate::registry::{ChannelRegistry, ChannelStats, RegistryError, RegistryRef};
use crate::store::StoreRef;

#[derive(Clone)]
pub struct Hub {
    broadcast: RegistryRef,
    per_user: RegistryRef,
}

/// Channel figures for both registries.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub broadcast: Vec<ChannelStats>,
    pub per_user: Vec<ChannelStats>,
}

impl Hub {
    pub fn new(store: StoreRef, broadcast_kind: ChannelKind, per_user_kind: ChannelKind) -> Self {
        Self {
            broadcast: Arc::new(ChannelRegistry::new(Arc::clone(&store), broadcast_kind)),
            per_user: Arc::new(ChannelRegistry::new(store, per_user_kind)),
        }
    }

    /// Registry for broadcast-kind channels.
    pub fn broadcast(&self) -> &RegistryRef {
        &self.broadcast
    }

    /// Registry for per-user channels.
    pub fn per_user(&self) -> &RegistryRef {
        &self.per_user
    }

    /// The configured broadcast channel.
    pub fn default_channel(&self) -> Result<ChannelName, RegistryError> {
        self.broadcast.channel_for(None)
    }

    /// Publishes `message` to `target` and returns the channel used.
    ///
    /// Explicit channels are published raw; per-user targets get the
    /// `user_event` envelope.
    pub async fn dispatch(
        &self,
        target: &BroadcastTarget,
        message: &str,
    ) -> Result<ChannelName, RegistryError> {
        match target {
            BroadcastTarget::Default => {
                let channel = self.default_channel()?;
                self.broadcast.broadcast(&channel, message).await;
                Ok(channel)
            }
            BroadcastTarget::Channel(channel) => {
                self.broadcast.publish(channel, message).await;
                Ok(channel.clone())
            }
            BroadcastTarget::Identity(user_id) => {
                let channel = self.per_user.channel_for(Some(user_id))?;
                self.per_user.broadcast(&channel, message).await;
                Ok(channel)
            }
        }
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            broadcast: self.broadcast.stats().await,
            per_user: self.per_user.stats().await,
        }
    }

    /// Shuts down both registries.
    pub async fn shutdown(&self) {
        self.broadcast.shutdown().await;
        self.per_user.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sink::{ChannelSink, Connection};
    use crate::store::MemoryStore;

    fn hub(store: &MemoryStore) -> Hub {
        Hub::new(
            Arc::new(store.clone()),
            ChannelKind::broadcast("lobby"),
            ChannelKind::per_identity("user_{}").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_resolves_targets() {
        let store = MemoryStore::new();
        let hub = hub(&store);

        assert_eq!(
            hub.dispatch(&BroadcastTarget::Default, "x").await.unwrap().as_str(),
            "lobby"
        );
        assert_eq!(
            hub.dispatch(&BroadcastTarget::Identity("7".into()), "x")
                .await
                .unwrap()
                .as_str(),
            "user_7"
        );
        assert!(matches!(
            hub.dispatch(&BroadcastTarget::Identity("bad id".into()), "x").await,
            Err(RegistryError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_to_identity_is_enveloped() {
        let store = MemoryStore::new();
        let hub = hub(&store);
        let channel = hub.per_user().channel_for(Some("7")).unwrap();

        let (sink, mut rx) = ChannelSink::new(4);
        hub.per_user()
            .join(&channel, Connection::new(Arc::new(sink)))
            .await
            .unwrap();

        hub.dispatch(&BroadcastTarget::Identity("7".into()), "hello")
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some(r#"{"type":"user_event","data":"hello"}"#));
    }
}
