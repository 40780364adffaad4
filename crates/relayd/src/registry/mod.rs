//! Channel registry: process-local member sets bridged to the shared store.
//!
//! Each channel with at least one local connection owns exactly one store
//! subscription and one [`BridgeHandle`]. The first `join` opens both, the
//! last `leave` tears both down. Broadcasting never writes to sockets
//! directly; it publishes to the store, and every process's bridge for that
//! channel fans the message out to its own members.
//!
//! # Architecture
//!
//! ```text
//!   Session ──join/leave──▶ ChannelRegistry ──PUBLISH──▶ SharedStore
//!                                │                           │
//!                                │ owns                      │ feed
//!                                ▼                           ▼
//!                  ChannelSlot { members, bridge } ◀──── Bridge task
//!                                │
//!                                └──send_text──▶ local connections
//! ```
//!
//! # Concurrency
//!
//! `join` and `leave` on the same channel are serialised by a per-channel
//! async mutex, held across subscribe and bridge shutdown. Different channels
//! never wait on each other. The member set itself sits behind a
//! `parking_lot::RwLock` that is only held for insert, remove and snapshot.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Store failures on broadcast are logged and swallowed
//! - Subscribe failures are returned to the caller; nothing is registered

mod bridge;

pub use bridge::BridgeHandle;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use relay_core::{ChannelKind, ChannelName, ConnectionId, DomainError};
use relay_protocol::encode_outbound;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sink::Connection;
use crate::store::{StoreError, StoreRef};
use bridge::Members;

/// Shared handle to a registry
pub type RegistryRef = Arc<ChannelRegistry>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to subscribe to channel {channel}: {source}")]
    Subscribe {
        channel: ChannelName,
        #[source]
        source: StoreError,
    },

    #[error("Invalid channel: {0}")]
    InvalidChannel(#[from] DomainError),

    #[error("Registry is shutting down")]
    ShuttingDown,
}

// ============================================================================
// Channel slot
// ============================================================================

/// Per-channel state. `bridge` is `Some` exactly while the channel is
/// subscribed.
#[derive(Default)]
struct ChannelSlot {
    members: Members,
    bridge: Option<BridgeHandle>,
}

impl ChannelSlot {
    fn is_subscribed(&self) -> bool {
        self.bridge.as_ref().is_some_and(|b| !b.is_finished())
    }

    fn is_idle(&self) -> bool {
        self.bridge.is_none() && self.members.read().is_empty()
    }
}

type SlotRef = Arc<tokio::sync::Mutex<ChannelSlot>>;

/// Point-in-time view of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub channel: ChannelName,
    pub members: usize,
    pub subscribed: bool,
}

// ============================================================================
// Registry
// ============================================================================

/// Registry of local connections for one [`ChannelKind`].
pub struct ChannelRegistry {
    store: StoreRef,
    kind: ChannelKind,
    slots: Mutex<HashMap<ChannelName, SlotRef>>,
    closed: AtomicBool,
}

impl ChannelRegistry {
    pub fn new(store: StoreRef, kind: ChannelKind) -> Self {
        Self {
            store,
            kind,
            slots: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Channel kind this registry serves.
    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Resolves the channel for `identity` under this registry's kind.
    pub fn channel_for(&self, identity: Option<&str>) -> Result<ChannelName, RegistryError> {
        Ok(self.kind.channel_for(identity)?)
    }

    /// Adds `connection` to `channel`.
    ///
    /// If the channel has no live subscription, one is opened and a bridge
    /// started before the connection is registered. Concurrent first joins
    /// on one channel produce a single subscription.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Subscribe` if the store refused the subscription;
    ///   the connection is not registered
    /// - `RegistryError::ShuttingDown` after [`shutdown`](Self::shutdown)
    pub async fn join(
        &self,
        channel: &ChannelName,
        connection: Connection,
    ) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }

        let slot = self.slot(channel);
        let mut guard = slot.lock().await;

        if !guard.is_subscribed() {
            // A bridge whose feed closed is reaped and replaced.
            if let Some(stale) = guard.bridge.take() {
                warn!(%channel, "Replacing bridge whose feed closed");
                stale.stop().await;
            }

            match self.store.subscribe(channel.as_str()).await {
                Ok(subscription) => {
                    let members = Arc::clone(&guard.members);
                    guard.bridge = Some(BridgeHandle::spawn(
                        channel.clone(),
                        Arc::clone(&self.store),
                        subscription,
                        members,
                    ));
                    info!(%channel, kind = self.kind.label(), "Channel subscribed");
                }
                Err(source) => {
                    drop(guard);
                    self.prune(channel, slot);
                    warn!(%channel, error = %source, "Join failed, subscription not opened");
                    return Err(RegistryError::Subscribe {
                        channel: channel.clone(),
                        source,
                    });
                }
            }
        }

        guard.members.write().insert(connection.id, connection.sink);
        drop(guard);
        self.prune(channel, slot);
        debug!(%channel, connection = %connection.id, "Connection joined");
        Ok(())
    }

    /// Removes `connection_id` from `channel`.
    ///
    /// When the last member leaves, the bridge is stopped and the
    /// subscription closed before this returns. Unknown connections are a
    /// no-op.
    pub async fn leave(&self, channel: &ChannelName, connection_id: ConnectionId) {
        let Some(slot) = self.slots.lock().get(channel).cloned() else {
            debug!(%channel, connection = %connection_id, "Leave for unknown channel");
            return;
        };

        let mut guard = slot.lock().await;
        if guard.members.write().remove(&connection_id).is_none() {
            debug!(%channel, connection = %connection_id, "Leave for unknown connection");
        }

        if guard.members.read().is_empty() {
            if let Some(bridge) = guard.bridge.take() {
                bridge.stop().await;
                info!(%channel, "Channel unsubscribed");
            }
        }
        drop(guard);

        self.prune(channel, slot);
        debug!(%channel, connection = %connection_id, "Connection left");
    }

    /// Publishes `message` on `channel`, framed by this registry's kind.
    ///
    /// Delivery happens through each process's bridge, including this
    /// one, so a sending connection receives its own message. Store errors
    /// are logged and dropped.
    pub async fn broadcast(&self, channel: &ChannelName, message: &str) {
        let payload = match encode_outbound(self.kind.envelope(), message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%channel, error = %e, "Dropping message that could not be framed");
                return;
            }
        };
        self.publish(channel, &payload).await;
    }

    /// Publishes `payload` on `channel` without framing.
    pub async fn publish(&self, channel: &ChannelName, payload: &str) {
        match self.store.publish(channel.as_str(), payload).await {
            Ok(()) => debug!(%channel, bytes = payload.len(), "Published"),
            Err(e) => warn!(%channel, error = %e, "Broadcast failed, message dropped"),
        }
    }

    /// 1 while `channel` has a live subscription in this process, else 0.
    pub async fn subscription_count(&self, channel: &ChannelName) -> usize {
        self.inspect(channel, |slot| usize::from(slot.is_subscribed()))
            .await
            .unwrap_or(0)
    }

    /// Number of local connections on `channel`.
    pub async fn member_count(&self, channel: &ChannelName) -> usize {
        self.inspect(channel, |slot| slot.members.read().len())
            .await
            .unwrap_or(0)
    }

    /// Channels that currently have a registry entry.
    pub fn channels(&self) -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = self.slots.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Per-channel member and subscription figures.
    pub async fn stats(&self) -> Vec<ChannelStats> {
        let mut stats = Vec::new();
        for channel in self.channels() {
            let figures = self
                .inspect(&channel, |slot| (slot.members.read().len(), slot.is_subscribed()))
                .await;
            if let Some((members, subscribed)) = figures {
                stats.push(ChannelStats {
                    channel,
                    members,
                    subscribed,
                });
            }
        }
        stats
    }

    /// Stops every bridge and drops every member. Later joins are refused.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<(ChannelName, SlotRef)> = self.slots.lock().drain().collect();
        for (channel, slot) in slots {
            let mut guard = slot.lock().await;
            guard.members.write().clear();
            if let Some(bridge) = guard.bridge.take() {
                bridge.stop().await;
                debug!(%channel, "Channel closed on shutdown");
            }
        }
        info!(kind = self.kind.label(), "Channel registry shut down");
    }

    /// Reads `channel`'s slot under its lock, then hands the reference back
    /// through [`prune`](Self::prune) so a concurrent last `leave` cannot
    /// strand an idle entry.
    async fn inspect<T>(
        &self,
        channel: &ChannelName,
        read: impl FnOnce(&ChannelSlot) -> T,
    ) -> Option<T> {
        let slot = self.slots.lock().get(channel).cloned()?;
        let value = read(&*slot.lock().await);
        self.prune(channel, slot);
        Some(value)
    }

    fn slot(&self, channel: &ChannelName) -> SlotRef {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(channel.clone()).or_default())
    }

    /// Drops the caller's reference to `slot` and removes the map entry if
    /// it is still `slot`, nobody else holds it, and it is idle.
    ///
    /// References are only taken and released here under the map lock, so
    /// the last of several concurrent callers sees itself as sole holder.
    fn prune(&self, channel: &ChannelName, slot: SlotRef) {
        let mut slots = self.slots.lock();
        let Some(current) = slots.get(channel) else {
            return;
        };
        if !Arc::ptr_eq(current, &slot) {
            return;
        }
        drop(slot);
        if Arc::strong_count(current) != 1 {
            return;
        }
        let idle = current.try_lock().map(|s| s.is_idle()).unwrap_or(false);
        if idle {
            slots.remove(channel);
        }
    }
}
