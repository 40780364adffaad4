//! Outbound halves of client connections.
//!
//! The registry holds connections only through [`MessageSink`], so the
//! bridge can write to WebSocket clients and in-process listeners alike.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use relay_core::ConnectionId;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// Type alias for a shared sink handle
pub type SinkRef = Arc<dyn MessageSink>;

/// Something a text message can be written to.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Writes one text message.
    async fn send_text(&self, text: &str) -> Result<(), SinkError>;
}

/// A connection as seen by the registry: identity plus outbound sink.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub sink: SinkRef,
}

impl Connection {
    /// Creates a connection handle with a fresh id.
    pub fn new(sink: SinkRef) -> Self {
        Self {
            id: ConnectionId::next(),
            sink,
        }
    }
}

/// Errors that can occur while writing to a connection.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Connection closed")]
    Closed,

    #[error("Send queue full")]
    Full,
}

// ============================================================================
// WebSocket sink
// ============================================================================

/// Write half of an axum WebSocket, serialised behind a mutex.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
    write_timeout: Duration,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>, write_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(inner),
            write_timeout,
        }
    }

    /// Sends a close frame; errors are ignored since the peer may be gone.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let _ = timeout(self.write_timeout, inner.close()).await;
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;

        match timeout(
            self.write_timeout,
            inner.send(Message::Text(text.to_owned().into())),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SinkError::Io(e.to_string())),
            Err(_) => Err(SinkError::WriteTimeout),
        }
    }
}

// ============================================================================
// Channel sink
// ============================================================================

/// Sink that forwards messages into a bounded in-process queue.
///
/// Useful for server-side listeners that want channel traffic without a
/// socket. A full queue drops the message rather than blocking fan-out.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    /// Creates a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_text(&self, text: &str) -> Result<(), SinkError> {
        match self.tx.try_send(text.to_string()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_and_reports_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.send_text("one").await.unwrap();
        assert_eq!(sink.send_text("two").await, Err(SinkError::Full));
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        assert_eq!(sink.send_text("gone").await, Err(SinkError::Closed));
    }

    #[test]
    fn test_sink_error_display() {
        assert!(SinkError::Io("broken pipe".into()).to_string().contains("broken pipe"));
    }
}
