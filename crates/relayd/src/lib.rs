//! relay daemon - WebSocket fan-out bridged to a shared pub/sub store
//!
//! This crate provides the core infrastructure for the relay daemon:
//! - `registry` - Per-channel member sets, one store subscription and bridge per open channel
//! - `session` - Lifecycle of one client connection on one channel
//! - `lock` - Distributed lock on the shared store
//! - `store` - Store contract with KeyDB and in-memory backends
//! - `server` - axum HTTP/WebSocket surface
//! - `queue` / `scheduler` - Server-side producers of broadcasts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       relayd process                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   RelayServer   │────▶│  Hub (ChannelRegistry x2)   │   │
//! │  │ (axum, ws/http) │     │  members + BridgeHandle     │   │
//! │  └────────┬────────┘     └──────┬───────────────▲──────┘   │
//! │           │ per client          │ PUBLISH       │ feed     │
//! │           ▼                     ▼               │          │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │     Session     │     │   SharedStore (KeyDB/mem)   │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! │  BroadcastQueue ◀── push job (DistributedLock per tick)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Store and socket failures are logged and contained

pub mod config;
pub mod hub;
pub mod lock;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod sink;
pub mod store;

pub use config::{ConfigError, RelayConfig};
pub use hub::Hub;
pub use lock::{DistributedLock, LockToken};
pub use queue::{spawn_broadcast_queue, BroadcastQueue, BroadcastRequest, QueueError};
pub use registry::{ChannelRegistry, RegistryError, RegistryRef};
pub use scheduler::spawn_push_job;
pub use server::{AppState, RelayServer, ServerError};
pub use session::{serve_websocket, Inbound, Session, SessionError, SessionSettings};
pub use sink::{ChannelSink, Connection, MessageSink, SinkError};
pub use store::{MemoryStore, SharedStore, StoreError, StoreRef};
