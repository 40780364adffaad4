//! Connection identity and liveness.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one client connection.
///
/// Used by the channel registry to remove exactly the connection that
/// left, even when several connections share a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier for this process.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Liveness of a connection session.
///
/// ```text
/// Accepting ──join ok──▶ Active ──disconnect──▶ Closed
///     │                                          ▲
///     └───────────── join failed ────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport accepted, not yet registered with a channel
    #[default]
    Accepting,
    /// Registered and relaying inbound messages
    Active,
    /// Terminal; no further registry interaction
    Closed,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Accepting, Self::Active)
                | (Self::Accepting, Self::Closed)
                | (Self::Active, Self::Closed)
        )
    }

    /// Whether the state is terminal.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accepting => "accepting",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        write!(f, "{label}")
    }
}
