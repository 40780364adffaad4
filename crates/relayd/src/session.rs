//! Connection session: one client's lifetime on one channel.
//!
//! ```text
//! Accepting ──join ok──▶ Active ──close / error / end──▶ Closed
//!     │                                                   ▲
//!     └────────────────── join failed ────────────────────┘
//! ```
//!
//! While `Active`, every inbound text frame is published to the session's
//! channel. The sender's own connection is a member of that channel, so it
//! receives its message back through the bridge like everyone else.
//!
//! The session is transport-agnostic: it reads [`Inbound`] events from any
//! stream and writes through the [`MessageSink`](crate::sink::MessageSink)
//! held by its [`Connection`]. [`serve_websocket`] adapts an axum socket.
//!
//! # Panic-Free Guarantees
//!
//! - `leave` runs on every exit path once `join` has succeeded
//! - Transport errors end the session; they are not propagated

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Stream, StreamExt};
use relay_core::{ChannelName, ConnectionId, ConnectionState};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::registry::{ChannelRegistry, RegistryError, RegistryRef};
use crate::sink::{Connection, WsSink};

/// One event read from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame
    Text(String),
    /// A binary frame of this many bytes
    Binary(usize),
    /// The client sent a close frame
    Close,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to join channel: {0}")]
    Join(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Limits applied to each session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Inbound text frames longer than this many bytes are dropped.
    pub max_message_size: usize,
    /// Per-write timeout on the client socket.
    pub write_timeout: Duration,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            write_timeout: config.write_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session<R> {
    registry: RegistryRef,
    channel: ChannelName,
    connection: Connection,
    inbound: R,
    settings: SessionSettings,
    shutdown: CancellationToken,
    state: ConnectionState,
}

impl<R> Session<R>
where
    R: Stream<Item = Result<Inbound, SessionError>> + Unpin + Send,
{
    /// Creates a session for an accepted transport. Nothing is registered
    /// until [`run`](Self::run).
    pub fn accept(
        registry: RegistryRef,
        channel: ChannelName,
        connection: Connection,
        inbound: R,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            channel,
            connection,
            inbound,
            settings,
            shutdown,
            state: ConnectionState::Accepting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Joins the channel, relays inbound text until the client goes away or
    /// shutdown is signalled, then leaves.
    ///
    /// Always ends in `Closed`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Join` if the channel could not be joined; the
    /// connection was never registered.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let id = self.connection.id;

        if let Err(e) = self
            .registry
            .join(&self.channel, self.connection.clone())
            .await
        {
            warn!(connection = %id, channel = %self.channel, error = %e, "Closing session, join failed");
            self.transition(ConnectionState::Closed);
            return Err(e.into());
        }
        self.transition(ConnectionState::Active);
        info!(connection = %id, channel = %self.channel, "Session active");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(connection = %id, "Session closing for shutdown");
                    break;
                }

                next = self.inbound.next() => {
                    match next {
                        Some(Ok(Inbound::Text(text))) => {
                            relay(&self.registry, &self.channel, id, &self.settings, &text).await;
                        }
                        Some(Ok(Inbound::Binary(len))) => {
                            debug!(connection = %id, len, "Ignoring binary frame");
                        }
                        Some(Ok(Inbound::Close)) | None => {
                            debug!(connection = %id, "Client disconnected");
                            break;
                        }
                        Some(Err(e)) => {
                            debug!(connection = %id, error = %e, "Client transport failed");
                            break;
                        }
                    }
                }
            }
        }

        self.registry.leave(&self.channel, id).await;
        self.transition(ConnectionState::Closed);
        info!(connection = %id, channel = %self.channel, "Session closed");
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            debug!(from = %self.state, to = %next, "Ignoring illegal session transition");
        }
    }
}

/// Publishes one inbound text frame unless it exceeds the size limit.
async fn relay(
    registry: &ChannelRegistry,
    channel: &ChannelName,
    id: ConnectionId,
    settings: &SessionSettings,
    text: &str,
) {
    if text.len() > settings.max_message_size {
        warn!(
            connection = %id,
            len = text.len(),
            max = settings.max_message_size,
            "Dropping oversized message"
        );
        return;
    }
    registry.broadcast(channel, text).await;
}

// ============================================================================
// WebSocket adapter
// ============================================================================

type InboundStream = Pin<Box<dyn Stream<Item = Result<Inbound, SessionError>> + Send>>;

/// Runs a session over an upgraded axum WebSocket.
pub async fn serve_websocket(
    socket: WebSocket,
    registry: RegistryRef,
    channel: ChannelName,
    settings: SessionSettings,
    shutdown: CancellationToken,
) -> ConnectionState {
    let (writer, reader) = socket.split();
    let sink = Arc::new(WsSink::new(writer, settings.write_timeout));

    let inbound: InboundStream = Box::pin(reader.filter_map(|frame| {
        futures::future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Binary(bytes.len()))),
            Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
            // Answered by the transport.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(SessionError::Transport(e.to_string()))),
        })
    }));

    let connection = Connection::new(sink.clone());
    let mut session = Session::accept(registry, channel, connection, inbound, settings, shutdown);
    // Join failures are already logged by the session.
    let _ = session.run().await;

    sink.close().await;
    session.state()
}
