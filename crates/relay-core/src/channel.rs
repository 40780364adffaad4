//! Channel names and channel kinds.
//!
//! A channel is a named broadcast group. It is never persisted: it exists
//! while at least one local connection is attached to it. A [`ChannelKind`]
//! decides how a channel name is derived for a connection and whether
//! outbound messages are wrapped in an envelope before publishing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Channel shared by every client of the broadcast kind.
pub const DEFAULT_BROADCAST_CHANNEL: &str = "ws_example_channel";

/// Template for per-identity channels; `{}` is replaced by the identity.
pub const DEFAULT_USER_CHANNEL_TEMPLATE: &str = "ws_example_user_channel_{}";

/// Placeholder substituted by the identity in a per-identity template.
pub const IDENTITY_PLACEHOLDER: &str = "{}";

/// Longest identity accepted when deriving a per-identity channel.
pub const MAX_IDENTITY_LEN: usize = 128;

// ============================================================================
// Channel Name
// ============================================================================

/// Name of a logical broadcast group.
///
/// The same string names the process-local member set and the shared
/// store's pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Creates a channel name without validation.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Creates a channel name, rejecting empty or whitespace-only input.
    pub fn parse(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::EmptyChannelName);
        }
        Ok(Self(name))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Envelope Kind
// ============================================================================

/// How an outbound message is framed before it is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeKind {
    /// Publish the payload verbatim.
    #[default]
    Raw,
    /// Wrap as `{"type": "user_event", "data": <payload>}`.
    UserEvent,
}

// ============================================================================
// Channel Kind
// ============================================================================

/// Naming and framing policy for a family of channels.
///
/// Every kind shares the same registry, bridge and session mechanics; only
/// the channel-name derivation and the outbound envelope differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// One well-known channel shared by all clients.
    Broadcast {
        /// The fixed channel name
        channel: ChannelName,
    },

    /// One channel per caller-supplied identity (e.g. a user id).
    PerIdentity {
        /// Name template containing a single `{}` placeholder
        template: String,
    },
}

impl ChannelKind {
    /// Creates a broadcast kind for a fixed channel.
    pub fn broadcast(channel: impl Into<ChannelName>) -> Self {
        Self::Broadcast {
            channel: channel.into(),
        }
    }

    /// Creates a per-identity kind from a template.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTemplate` unless the template contains
    /// exactly one `{}` placeholder.
    pub fn per_identity(template: impl Into<String>) -> DomainResult<Self> {
        let template = template.into();
        if template.matches(IDENTITY_PLACEHOLDER).count() != 1 {
            return Err(DomainError::InvalidTemplate { template });
        }
        Ok(Self::PerIdentity { template })
    }

    /// Derives the channel name for a connection.
    ///
    /// Broadcast kinds ignore the identity. Per-identity kinds require one.
    pub fn channel_for(&self, identity: Option<&str>) -> DomainResult<ChannelName> {
        match self {
            Self::Broadcast { channel } => Ok(channel.clone()),
            Self::PerIdentity { template } => {
                let identity = identity.ok_or_else(|| DomainError::InvalidIdentity {
                    identity: String::new(),
                    reason: "identity is required for this channel kind".to_string(),
                })?;
                validate_identity(identity)?;
                Ok(ChannelName(template.replacen(IDENTITY_PLACEHOLDER, identity, 1)))
            }
        }
    }

    /// Returns the outbound envelope for this kind.
    pub fn envelope(&self) -> EnvelopeKind {
        match self {
            Self::Broadcast { .. } => EnvelopeKind::Raw,
            Self::PerIdentity { .. } => EnvelopeKind::UserEvent,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::PerIdentity { .. } => "per_identity",
        }
    }
}

impl Default for ChannelKind {
    fn default() -> Self {
        Self::broadcast(DEFAULT_BROADCAST_CHANNEL)
    }
}

fn validate_identity(identity: &str) -> DomainResult<()> {
    let invalid = |reason: &str| DomainError::InvalidIdentity {
        identity: identity.to_string(),
        reason: reason.to_string(),
    };

    if identity.is_empty() {
        return Err(invalid("identity is empty"));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(invalid("identity is too long"));
    }
    if !identity
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(invalid("identity contains unsupported characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_kind_ignores_identity() {
        let kind = ChannelKind::default();
        assert_eq!(
            kind.channel_for(Some("42")).unwrap().as_str(),
            DEFAULT_BROADCAST_CHANNEL
        );
        assert_eq!(kind.channel_for(None).unwrap().as_str(), DEFAULT_BROADCAST_CHANNEL);
        assert_eq!(kind.envelope(), EnvelopeKind::Raw);
    }

    #[test]
    fn test_per_identity_kind_derives_name() {
        let kind = ChannelKind::per_identity(DEFAULT_USER_CHANNEL_TEMPLATE).unwrap();
        let name = kind.channel_for(Some("42")).unwrap();
        assert_eq!(name.as_str(), "ws_example_user_channel_42");
        assert_eq!(kind.envelope(), EnvelopeKind::UserEvent);
    }

    #[test]
    fn test_per_identity_requires_identity() {
        let kind = ChannelKind::per_identity("user:{}").unwrap();
        assert!(matches!(
            kind.channel_for(None),
            Err(DomainError::InvalidIdentity { .. })
        ));
        assert!(kind.channel_for(Some("")).is_err());
        assert!(kind.channel_for(Some("a b")).is_err());
        assert!(kind.channel_for(Some(&"x".repeat(MAX_IDENTITY_LEN + 1))).is_err());
    }

    #[test]
    fn test_template_needs_one_placeholder() {
        assert!(ChannelKind::per_identity("no-placeholder").is_err());
        assert!(ChannelKind::per_identity("{}-{}").is_err());
        assert!(ChannelKind::per_identity("room-{}").is_ok());
    }

    #[test]
    fn test_channel_name_parse() {
        assert!(ChannelName::parse("general").is_ok());
        assert!(matches!(
            ChannelName::parse("   "),
            Err(DomainError::EmptyChannelName)
        ));
    }
}
