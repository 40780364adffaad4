//! Periodic push job.
//!
//! Every interval, one relay process (whichever wins the distributed lock
//! for that tick) submits the current local time to the push channel.
//! The lock is not released; its TTL equals the interval, so other
//! processes skip the rest of the tick.

use std::time::Duration;

use chrono::Local;
use relay_core::ChannelName;
use relay_protocol::BroadcastTarget;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock::DistributedLock;
use crate::queue::{BroadcastQueue, BroadcastRequest};

/// Lock key guarding one push per tick across processes.
pub const PUSH_LOCK_KEY: &str = "relay:lock:push";

/// Text pushed on each tick.
pub fn push_message() -> String {
    format!("current time: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

/// Shortest accepted push interval.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the push job; it runs until `cancel` fires.
///
/// Intervals below one second are raised to one second.
pub fn spawn_push_job(
    queue: BroadcastQueue,
    lock: DistributedLock,
    channel: ChannelName,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let every = every.max(MIN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(%channel, interval_secs = every.as_secs(), "Push job started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if lock.acquire(PUSH_LOCK_KEY, every).await.is_none() {
                        debug!("Push skipped, another process holds this tick");
                        continue;
                    }
                    let request = BroadcastRequest::new(
                        BroadcastTarget::Channel(channel.clone()),
                        push_message(),
                    );
                    if let Err(e) = queue.submit(request).await {
                        warn!(error = %e, "Push job stopping, queue closed");
                        break;
                    }
                }
            }
        }

        info!("Push job stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relay_core::ChannelKind;

    use super::*;
    use crate::config::LockConfig;
    use crate::hub::Hub;
    use crate::queue::spawn_broadcast_queue;
    use crate::sink::{ChannelSink, Connection};
    use crate::store::MemoryStore;

    #[test]
    fn test_push_message_format() {
        let message = push_message();
        let stamp = message.trim_start_matches("current time: ");
        assert_eq!(stamp.len(), "2024-01-01 00:00:00".len());
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").is_ok());
    }

    #[tokio::test]
    async fn test_only_one_job_pushes_per_tick() {
        let store = MemoryStore::new();
        let hub = Hub::new(
            Arc::new(store.clone()),
            ChannelKind::broadcast("lobby"),
            ChannelKind::per_identity("user_{}").unwrap(),
        );
        let channel = ChannelName::new("lobby");
        let (sink, mut rx) = ChannelSink::new(16);
        hub.broadcast()
            .join(&channel, Connection::new(Arc::new(sink)))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (queue, _worker) = spawn_broadcast_queue(hub, 16, cancel.clone());
        let lock = DistributedLock::new(Arc::new(store.clone()), &LockConfig::default());

        // Two "processes" sharing one store.
        let every = Duration::from_secs(60);
        let a = spawn_push_job(queue.clone(), lock.clone(), channel.clone(), every, cancel.clone());
        let b = spawn_push_job(queue, lock, channel, every, cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(first.is_some_and(|m| m.starts_with("current time: ")));
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );

        cancel.cancel();
        a.await.unwrap();
        b.await.unwrap();
    }
}
