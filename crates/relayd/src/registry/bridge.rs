//! Pub/sub bridge: one task per open channel subscription.
//!
//! The bridge pulls messages off the store feed and writes each one
//! verbatim to every local member of the channel. It owns the feed for its
//! whole life and closes it on every exit path.
//!
//! When the store ends a feed while the channel still has members, the
//! closed feed is released and a fresh one is opened in its place, retrying
//! with backoff until it succeeds or the bridge is stopped. The handle stays
//! live throughout, so a channel with members never drops out of the
//! registry's subscription count.
//!
//! # Panic-Free Guarantees
//!
//! - Write failures are logged per connection and never abort the fan-out
//! - Feed closure ends the inner loop cleanly
//! - Resubscribe failures are logged and retried

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use relay_core::{ChannelName, ConnectionId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sink::SinkRef;
use crate::store::{StoreRef, Subscription};

/// Local member set of one channel, shared between the registry and the bridge.
pub(crate) type Members = Arc<RwLock<BTreeMap<ConnectionId, SinkRef>>>;

/// First wait after a failed resubscribe.
const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Longest wait between resubscribe attempts.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Owned handle to a running bridge task.
pub struct BridgeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Starts a bridge for `subscription`, fanning out to `members`.
    ///
    /// `store` is used to reopen the feed if the store closes it.
    pub(crate) fn spawn(
        channel: ChannelName,
        store: StoreRef,
        subscription: Box<dyn Subscription>,
        members: Members,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            channel,
            store,
            subscription,
            members,
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    /// True once the task has exited, either stopped or left with no
    /// members after its feed closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the task to stop and waits until it has closed its feed.
    ///
    /// The signal is observed between messages; an in-progress fan-out
    /// completes first.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Bridge task ended abnormally");
        }
    }
}

/// Why one feed's delivery loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeExit {
    Stopped,
    FeedClosed,
}

async fn supervise(
    channel: ChannelName,
    store: StoreRef,
    mut subscription: Box<dyn Subscription>,
    members: Members,
    cancel: CancellationToken,
) {
    debug!(%channel, "Bridge started");

    loop {
        if run(&channel, subscription, &members, &cancel).await == BridgeExit::Stopped {
            break;
        }
        match resubscribe(&channel, &store, &members, &cancel).await {
            Some(next) => subscription = next,
            None => break,
        }
    }

    debug!(%channel, "Bridge stopped");
}

/// Delivers messages from one feed until it closes or the bridge is
/// stopped. The feed is closed before returning.
async fn run(
    channel: &ChannelName,
    mut subscription: Box<dyn Subscription>,
    members: &Members,
    cancel: &CancellationToken,
) -> BridgeExit {
    let exit = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(%channel, "Bridge stopping");
                break BridgeExit::Stopped;
            }

            next = subscription.next_message() => {
                match next {
                    Some(payload) => fan_out(channel, members, &payload).await,
                    None => {
                        warn!(%channel, "Subscription feed closed");
                        break BridgeExit::FeedClosed;
                    }
                }
            }
        }
    };

    subscription.close().await;
    exit
}

/// Opens a replacement feed for `channel`.
///
/// Returns `None` when the bridge is stopped or the channel has no members
/// left.
async fn resubscribe(
    channel: &ChannelName,
    store: &StoreRef,
    members: &Members,
    cancel: &CancellationToken,
) -> Option<Box<dyn Subscription>> {
    let mut backoff = RESUBSCRIBE_BACKOFF_MIN;

    loop {
        if members.read().is_empty() {
            debug!(%channel, "No members left, not resubscribing");
            return None;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return None,

            result = store.subscribe(channel.as_str()) => match result {
                Ok(subscription) => {
                    info!(%channel, "Channel resubscribed");
                    return Some(subscription);
                }
                Err(e) => {
                    warn!(%channel, error = %e, retry_in = ?backoff, "Resubscribe failed");
                }
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
    }
}

/// Writes `payload` to a snapshot of the member set, in id order.
async fn fan_out(channel: &ChannelName, members: &Members, payload: &str) {
    // Snapshot so no lock is held across writes.
    let targets: Vec<(ConnectionId, SinkRef)> = members
        .read()
        .iter()
        .map(|(id, sink)| (*id, Arc::clone(sink)))
        .collect();

    for (id, sink) in targets {
        if let Err(e) = sink.send_text(payload).await {
            debug!(%channel, connection = %id, error = %e, "Failed to deliver message");
        }
    }
}
