//! Integration tests for the channel registry and its pub/sub bridges.
//!
//! Each test runs one or more registries against a shared in-memory store,
//! standing in for several relay processes on one KeyDB instance.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use relay_core::{ChannelKind, ChannelName, ConnectionId};
use relayd::{ChannelRegistry, ChannelSink, Connection, MemoryStore, RegistryRef};
use tokio::sync::mpsc::Receiver;

// ============================================================================
// Test Helpers
// ============================================================================

/// Maximum time to wait for a fan-out to arrive
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Window in which no message is expected
const QUIET_PERIOD: Duration = Duration::from_millis(100);

fn registry(store: &MemoryStore) -> RegistryRef {
    Arc::new(ChannelRegistry::new(
        Arc::new(store.clone()),
        ChannelKind::broadcast("general"),
    ))
}

fn client() -> (Connection, Receiver<String>) {
    let (sink, rx) = ChannelSink::new(64);
    (Connection::new(Arc::new(sink)), rx)
}

async fn expect_message(rx: &mut Receiver<String>) -> String {
    tokio::time::timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .expect("message within timeout")
        .expect("sink open")
}

/// Passes on timeout or on a closed sink; fails only if a message arrives.
async fn expect_silence(rx: &mut Receiver<String>) {
    if let Ok(Some(message)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("no message expected, got {message:?}");
    }
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_joins_open_one_subscription() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let channel = ChannelName::new("general");

    let mut receivers = Vec::new();
    let mut joins = Vec::new();
    for _ in 0..16 {
        let (conn, rx) = client();
        receivers.push(rx);
        let registry = Arc::clone(&registry);
        let channel = channel.clone();
        joins.push(tokio::spawn(async move { registry.join(&channel, conn).await }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }

    assert_eq!(registry.member_count(&channel).await, 16);
    assert_eq!(registry.subscription_count(&channel).await, 1);
    assert_eq!(store.subscriber_count("general"), 1);

    registry.broadcast(&channel, "all").await;
    for rx in &mut receivers {
        assert_eq!(expect_message(rx).await, "all");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_join_leave_races_keep_subscription_invariant() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let channel = ChannelName::new("general");

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let registry = Arc::clone(&registry);
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            let (conn, _rx) = client();
            let id = conn.id;
            registry.join(&channel, conn).await.unwrap();
            tokio::task::yield_now().await;
            registry.leave(&channel, id).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(registry.member_count(&channel).await, 0);
    assert_eq!(registry.subscription_count(&channel).await, 0);
    assert_eq!(store.subscriber_count("general"), 0);
    assert!(registry.channels().is_empty());

    let (conn, mut rx) = client();
    registry.join(&channel, conn).await.unwrap();
    assert_eq!(registry.subscription_count(&channel).await, 1);
    registry.broadcast(&channel, "after race").await;
    assert_eq!(expect_message(&mut rx).await, "after race");
}

#[tokio::test]
async fn test_last_leave_then_rejoin_creates_fresh_subscription() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let room = ChannelName::new("room-42");

    // Hold the first sink so its receiver stays open after the leave.
    let (first_sink, mut first_rx) = ChannelSink::new(64);
    let first_sink = Arc::new(first_sink);
    let conn = Connection::new(first_sink.clone());
    let first_id = conn.id;
    registry.join(&room, conn).await.unwrap();
    registry.leave(&room, first_id).await;

    assert_eq!(registry.subscription_count(&room).await, 0);
    assert_eq!(store.subscriber_count("room-42"), 0);

    // Nobody subscribed: the publish goes nowhere.
    registry.broadcast(&room, "into the void").await;
    expect_silence(&mut first_rx).await;

    let (conn, mut second_rx) = client();
    registry.join(&room, conn).await.unwrap();
    assert_eq!(registry.subscription_count(&room).await, 1);
    assert_eq!(store.subscriber_count("room-42"), 1);

    registry.broadcast(&room, "welcome back").await;
    assert_eq!(expect_message(&mut second_rx).await, "welcome back");
    expect_silence(&mut first_rx).await;
    assert!(first_rx.try_recv().is_err());
    drop(first_sink);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let a = ChannelName::new("a");
    let b = ChannelName::new("b");

    let (conn_a, mut rx_a) = client();
    let (conn_b, mut rx_b) = client();
    registry.join(&a, conn_a).await.unwrap();
    registry.join(&b, conn_b).await.unwrap();
    assert_eq!(registry.channels(), vec![a.clone(), b.clone()]);

    registry.broadcast(&a, "only a").await;
    assert_eq!(expect_message(&mut rx_a).await, "only a");
    expect_silence(&mut rx_b).await;
}

// ============================================================================
// End-to-end fan-out
// ============================================================================

#[tokio::test]
async fn test_two_connections_receive_each_others_messages() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (a, mut rx_a) = client();
    let (b, mut rx_b) = client();
    registry.join(&general, a).await.unwrap();
    registry.join(&general, b).await.unwrap();

    registry.broadcast(&general, "hello").await;
    assert_eq!(expect_message(&mut rx_a).await, "hello");
    assert_eq!(expect_message(&mut rx_b).await, "hello");

    registry.broadcast(&general, "again").await;
    assert_eq!(expect_message(&mut rx_a).await, "again");
    assert_eq!(expect_message(&mut rx_b).await, "again");
}

#[tokio::test]
async fn test_broadcast_crosses_processes_sharing_a_store() {
    let store = MemoryStore::new();
    let process_a = registry(&store);
    let process_b = registry(&store);
    let general = ChannelName::new("general");

    let (on_a, mut rx_a) = client();
    let (on_b, mut rx_b) = client();
    process_a.join(&general, on_a).await.unwrap();
    process_b.join(&general, on_b).await.unwrap();

    // One subscription per process.
    assert_eq!(store.subscriber_count("general"), 2);

    process_a.broadcast(&general, "from a").await;
    assert_eq!(expect_message(&mut rx_a).await, "from a");
    assert_eq!(expect_message(&mut rx_b).await, "from a");
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (conn, mut rx) = client();
    registry.join(&general, conn).await.unwrap();

    for i in 0..20 {
        registry.broadcast(&general, &format!("m{i}")).await;
    }
    for i in 0..20 {
        assert_eq!(expect_message(&mut rx).await, format!("m{i}"));
    }
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_store_outage_during_broadcast_is_swallowed() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (conn, mut rx) = client();
    registry.join(&general, conn).await.unwrap();

    store.set_available(false);
    registry.broadcast(&general, "lost").await;
    expect_silence(&mut rx).await;

    store.set_available(true);
    registry.broadcast(&general, "recovered").await;
    assert_eq!(expect_message(&mut rx).await, "recovered");
}

#[tokio::test]
async fn test_closed_client_does_not_block_others() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (gone, gone_rx) = client();
    let (alive, mut alive_rx) = client();
    registry.join(&general, gone).await.unwrap();
    registry.join(&general, alive).await.unwrap();
    drop(gone_rx);

    registry.broadcast(&general, "still here").await;
    assert_eq!(expect_message(&mut alive_rx).await, "still here");
    // Dead members stay until their session leaves.
    assert_eq!(registry.member_count(&general).await, 2);
}

#[tokio::test]
async fn test_leave_with_unknown_id_keeps_subscription() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (conn, _rx) = client();
    registry.join(&general, conn).await.unwrap();
    registry.leave(&general, ConnectionId::from_raw(u64::MAX)).await;

    assert_eq!(registry.member_count(&general).await, 1);
    assert_eq!(registry.subscription_count(&general).await, 1);
}

#[tokio::test]
async fn test_dropped_feed_recovers_without_new_join() {
    let store = MemoryStore::new();
    let registry = registry(&store);
    let general = ChannelName::new("general");

    let (conn, mut rx) = client();
    registry.join(&general, conn).await.unwrap();

    // The store drops every subscriber, as after a server restart.
    store.drop_channel("general");

    tokio::time::timeout(DELIVERY_TIMEOUT, async {
        while store.subscriber_count("general") != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("feed reopened");

    assert_eq!(registry.member_count(&general).await, 1);
    assert_eq!(registry.subscription_count(&general).await, 1);

    registry.broadcast(&general, "heard").await;
    assert_eq!(expect_message(&mut rx).await, "heard");
}
