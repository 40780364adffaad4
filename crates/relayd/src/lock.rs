//! Distributed mutual-exclusion lock on the shared store.
//!
//! A lock record is `(key, token, expiry)`. It is created only by an atomic
//! set-if-absent with expiry and removed only by a compare-and-delete that
//! matches the caller's token, or by the TTL running out. Release never
//! deletes unconditionally, so a caller whose lock already expired cannot
//! remove a record that now belongs to someone else.
//!
//! Store failures never turn into a granted lock: `acquire` reports `None`
//! and `release` logs and returns, leaving the TTL as the backstop.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::store::StoreRef;

/// Opaque proof of one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named exclusive locks backed by the shared store.
#[derive(Clone)]
pub struct DistributedLock {
    store: StoreRef,
    default_ttl: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    /// Creates a lock client with defaults from `config`.
    pub fn new(store: StoreRef, config: &LockConfig) -> Self {
        Self {
            store,
            default_ttl: config.default_ttl(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Configured default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Default retry interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Makes one attempt to take `key` for `ttl`.
    ///
    /// Returns `None` immediately if another holder has the key or the
    /// store cannot be reached.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let token = LockToken::generate();
        match self.store.set_if_absent(key, token.as_str(), ttl).await {
            Ok(true) => {
                debug!(%key, ?ttl, "Lock acquired");
                Some(token)
            }
            Ok(false) => {
                debug!(%key, "Lock held elsewhere");
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "Lock acquire failed, treating as not acquired");
                None
            }
        }
    }

    /// Retries [`acquire`](Self::acquire) every `poll_interval` until it
    /// succeeds or `ttl` has elapsed since the first attempt.
    ///
    /// The same duration bounds the wait and the record's expiry, so a
    /// waiter gives up no later than one poll interval after a stuck
    /// holder's record would have expired.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        poll_interval: Duration,
    ) -> Option<LockToken> {
        let deadline = Instant::now() + ttl;
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            if let Some(token) = self.acquire(key, ttl).await {
                if attempts > 1 {
                    debug!(%key, attempts, "Lock acquired after retry");
                }
                return Some(token);
            }

            let now = Instant::now();
            if now >= deadline {
                info!(%key, attempts, ?ttl, "Timed out acquiring lock");
                return None;
            }

            debug!(%key, attempts, "Retrying lock acquisition");
            sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Releases `key` if it is still held with `token`.
    ///
    /// Releasing a lock that expired or belongs to someone else is a silent
    /// no-op. Store failures are logged and swallowed.
    pub async fn release(&self, key: &str, token: &LockToken) {
        match self.store.compare_and_delete(key, token.as_str()).await {
            Ok(true) => debug!(%key, "Lock released"),
            Ok(false) => debug!(%key, "Lock release skipped: expired or held by another owner"),
            Err(e) => warn!(%key, error = %e, "Lock release failed; record will expire via TTL"),
        }
    }

    /// Runs `critical` while holding `key`, releasing afterwards.
    ///
    /// Makes a single acquisition attempt. Returns `None` without running
    /// `critical` when the lock is not acquired.
    pub async fn run_exclusive<F, T>(&self, key: &str, ttl: Duration, critical: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let token = self.acquire(key, ttl).await?;
        let output = critical.await;
        self.release(key, &token).await;
        Some(output)
    }
}
