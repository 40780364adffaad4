//! Broadcast queue: hands messages from any context to the registries.
//!
//! Producers hold a cheap-to-clone [`BroadcastQueue`]. Async code awaits
//! [`submit`](BroadcastQueue::submit); plain threads (blocking jobs, FFI
//! callbacks) use [`submit_blocking`](BroadcastQueue::submit_blocking) or
//! [`try_submit`](BroadcastQueue::try_submit). A single worker task drains
//! the queue in order into [`Hub::dispatch`].

use relay_protocol::BroadcastTarget;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::Hub;

/// Default queue depth.
pub const QUEUE_CAPACITY: usize = 256;

/// One message waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub target: BroadcastTarget,
    pub message: String,
}

impl BroadcastRequest {
    pub fn new(target: BroadcastTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Broadcast queue is full")]
    Full,

    #[error("Broadcast queue is closed")]
    Closed,
}

/// Producer handle for the broadcast queue.
#[derive(Clone)]
pub struct BroadcastQueue {
    sender: mpsc::Sender<BroadcastRequest>,
}

impl BroadcastQueue {
    /// Waits for room and enqueues `request`.
    pub async fn submit(&self, request: BroadcastRequest) -> Result<(), QueueError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Enqueues `request` without waiting.
    pub fn try_submit(&self, request: BroadcastRequest) -> Result<(), QueueError> {
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Blocks the current thread until `request` is enqueued.
    ///
    /// Must not be called from inside an async context.
    pub fn submit_blocking(&self, request: BroadcastRequest) -> Result<(), QueueError> {
        self.sender
            .blocking_send(request)
            .map_err(|_| QueueError::Closed)
    }
}

/// Spawns the worker and returns the producer handle.
///
/// The worker stops when `cancel` fires or every producer is dropped.
pub fn spawn_broadcast_queue(
    hub: Hub,
    capacity: usize,
    cancel: CancellationToken,
) -> (BroadcastQueue, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run_worker(hub, receiver, cancel));
    (BroadcastQueue { sender }, task)
}

async fn run_worker(
    hub: Hub,
    mut receiver: mpsc::Receiver<BroadcastRequest>,
    cancel: CancellationToken,
) {
    debug!("Broadcast queue worker started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            request = receiver.recv() => {
                let Some(request) = request else {
                    debug!("All queue producers dropped");
                    break;
                };
                match hub.dispatch(&request.target, &request.message).await {
                    Ok(channel) => debug!(%channel, "Queued broadcast published"),
                    Err(e) => warn!(error = %e, target = ?request.target, "Dropping queued broadcast"),
                }
            }
        }
    }

    info!("Broadcast queue worker stopped");
}
