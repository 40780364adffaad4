//! relay protocol - wire formats
//!
//! Messages between clients and channels are opaque text. The only framed
//! payloads are the per-identity `user_event` envelope and the JSON bodies
//! of the HTTP broadcast endpoint.

pub mod message;

pub use message::{
    encode_outbound, BroadcastAccepted, BroadcastBody, BroadcastTarget, OutboundEnvelope,
    ProtocolError,
};
