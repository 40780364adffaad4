//! Outbound envelopes and HTTP broadcast bodies.

use relay_core::{ChannelName, EnvelopeKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured envelope wrapped around per-identity publishes.
///
/// Serialized as `{"type": "user_event", "data": <message>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    /// Event addressed to one identity's connections
    UserEvent {
        /// The message text as sent
        data: String,
    },
}

impl OutboundEnvelope {
    /// Creates a user event envelope.
    pub fn user_event(data: impl Into<String>) -> Self {
        Self::UserEvent { data: data.into() }
    }
}

/// Frames `message` for publishing according to `kind`.
///
/// Raw payloads pass through unchanged. Non-ASCII text is kept as-is in
/// the JSON output rather than escaped.
pub fn encode_outbound(kind: EnvelopeKind, message: &str) -> Result<String, ProtocolError> {
    match kind {
        EnvelopeKind::Raw => Ok(message.to_string()),
        EnvelopeKind::UserEvent => serde_json::to_string(&OutboundEnvelope::user_event(message))
            .map_err(|e| ProtocolError::Encode(e.to_string())),
    }
}

/// Where an HTTP broadcast request should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastTarget {
    /// The configured broadcast-kind channel
    Default,
    /// An explicit channel, published raw
    Channel(ChannelName),
    /// The per-identity channel of this identity, enveloped
    Identity(String),
}

/// Body of `POST /api/broadcast`.
///
/// At most one of `channel` and `user_id` may be set; when neither is, the
/// message goes to the default broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub message: String,
}

impl BroadcastBody {
    /// Resolves the delivery target.
    pub fn target(&self) -> Result<BroadcastTarget, ProtocolError> {
        match (&self.channel, &self.user_id) {
            (Some(_), Some(_)) => Err(ProtocolError::AmbiguousTarget),
            (Some(channel), None) => ChannelName::parse(channel.as_str())
                .map(BroadcastTarget::Channel)
                .map_err(|e| ProtocolError::InvalidTarget(e.to_string())),
            (None, Some(user_id)) => Ok(BroadcastTarget::Identity(user_id.clone())),
            (None, None) => Ok(BroadcastTarget::Default),
        }
    }
}

/// Response body of an accepted broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastAccepted {
    /// Channel the message was published to
    pub channel: String,
}

/// Errors produced while encoding or interpreting wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Only one of 'channel' and 'user_id' may be set")]
    AmbiguousTarget,

    #[error("Invalid broadcast target: {0}")]
    InvalidTarget(String),
}
