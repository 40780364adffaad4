//! Integration tests for the distributed lock.
//!
//! Timing tests run on a paused tokio clock, which also drives key expiry
//! in the in-memory store.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use relayd::config::LockConfig;
use relayd::{DistributedLock, MemoryStore};
use tokio::time::Instant;

fn lock_on(store: &MemoryStore) -> DistributedLock {
    DistributedLock::new(Arc::new(store.clone()), &LockConfig::default())
}

const POLL: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_second_acquire_fails_while_held() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    let token = lock.acquire("order:1", Duration::from_secs(10)).await;
    assert!(token.is_some());
    assert!(lock.acquire("order:1", Duration::from_secs(10)).await.is_none());

    // Other keys are independent.
    assert!(lock.acquire("order:2", Duration::from_secs(10)).await.is_some());
}

#[tokio::test]
async fn test_release_requires_matching_token() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    let mine = lock.acquire("order:1", Duration::from_secs(10)).await.unwrap();
    let stranger = relayd::LockToken::generate();

    lock.release("order:1", &stranger).await;
    assert_eq!(store.get("order:1").as_deref(), Some(mine.as_str()));

    lock.release("order:1", &mine).await;
    assert!(store.get("order:1").is_none());

    // Double release is a no-op.
    lock.release("order:1", &mine).await;
    assert!(lock.acquire("order:1", Duration::from_secs(10)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_cannot_be_released_by_old_holder() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    let old = lock.acquire("job", Duration::from_secs(1)).await.unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;

    let new = lock.acquire("job", Duration::from_secs(10)).await.unwrap();
    lock.release("job", &old).await;
    assert_eq!(store.get("job").as_deref(), Some(new.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_holder_releases() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    let held = lock.acquire("k", Duration::from_secs(10)).await.unwrap();
    let releaser = lock.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        releaser.release("k", &held).await;
    });

    let start = Instant::now();
    let token = lock
        .acquire_with_retry("k", Duration::from_secs(1), POLL)
        .await;
    let waited = start.elapsed();

    assert!(token.is_some());
    assert!(waited >= Duration::from_millis(300), "waited {waited:?}");
    assert!(waited <= Duration::from_millis(400), "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_gives_up_after_ttl() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    let _held = lock.acquire("k", Duration::from_secs(10)).await.unwrap();

    let start = Instant::now();
    let token = lock
        .acquire_with_retry("k", Duration::from_secs(1), POLL)
        .await;
    let waited = start.elapsed();

    assert!(token.is_none());
    assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
    assert!(waited <= Duration::from_secs(1) + POLL, "waited {waited:?}");
}

#[tokio::test(start_paused = true)]
async fn test_retry_picks_up_expired_record() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);

    // A crashed holder: never released, expires after 500ms.
    let _crashed = lock.acquire("k", Duration::from_millis(500)).await.unwrap();

    let token = lock
        .acquire_with_retry("k", Duration::from_secs(2), POLL)
        .await;
    assert!(token.is_some());
}

#[tokio::test]
async fn test_unreachable_store_never_grants() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);
    store.set_available(false);

    assert!(lock.acquire("k", Duration::from_secs(1)).await.is_none());
    assert!(lock
        .run_exclusive("k", Duration::from_secs(1), async { "ran" })
        .await
        .is_none());

    store.set_available(true);
    assert!(lock.acquire("k", Duration::from_secs(1)).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_retry_times_out() {
    let store = MemoryStore::new();
    let lock = lock_on(&store);
    store.set_available(false);

    let token = lock
        .acquire_with_retry("k", Duration::from_millis(500), POLL)
        .await;
    assert!(token.is_none());
}
