//! relay core - shared domain types
//!
//! This crate provides the types shared between the wire protocol
//! (`relay-protocol`) and the daemon (`relayd`): channel names, channel
//! kinds and connection identity.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod channel;
pub mod connection;
pub mod error;

// Re-exports for convenience
pub use channel::{
    ChannelKind, ChannelName, EnvelopeKind, DEFAULT_BROADCAST_CHANNEL,
    DEFAULT_USER_CHANNEL_TEMPLATE,
};
pub use connection::{ConnectionId, ConnectionState};
pub use error::{DomainError, DomainResult};
