//! HTTP and WebSocket surface of the relay daemon.
//!
//! Routes:
//!
//! | Route                 | Purpose                                        |
//! |-----------------------|------------------------------------------------|
//! | `GET /ws`             | WebSocket on the broadcast channel             |
//! | `GET /ws/{user_id}`   | WebSocket on that user's channel               |
//! | `POST /api/broadcast` | Publish a message (`202 Accepted`)             |
//! | `GET /health`         | `200` when the store answers PING, else `503`  |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │  TcpListener    │
//! └───────┬─────────┘
//!         │ upgrade
//!         ▼
//! ┌─────────────────┐  join/leave/broadcast  ┌─────────────────┐
//! │    Session      │───────────────────────▶│ ChannelRegistry │
//! │  (per client)   │                        │  (via Hub)      │
//! └─────────────────┘                        └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - Handlers map every failure to a status code
//! - Shutdown is driven by a `CancellationToken`

use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::ChannelName;
use relay_protocol::{BroadcastAccepted, BroadcastBody};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{Hub, HubStats};
use crate::registry::RegistryRef;
use crate::session::{serve_websocket, SessionSettings};
use crate::store::StoreRef;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub store: StoreRef,
    pub settings: SessionSettings,
    pub shutdown: CancellationToken,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub channels: HubStats,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Builds the router for `state`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_broadcast))
        .route("/ws/{user_id}", get(ws_user))
        .route("/api/broadcast", post(broadcast))
        .route("/health", get(health))
        .with_state(state)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, registry: RegistryRef, channel: ChannelName) -> Response {
    debug!(%channel, "WebSocket upgrade");
    ws.on_upgrade(move |socket| async move {
        serve_websocket(socket, registry, channel, state.settings, state.shutdown).await;
    })
}

/// GET /ws
async fn ws_broadcast(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let registry = state.hub.broadcast().clone();
    match registry.channel_for(None) {
        Ok(channel) => upgrade(ws, state, registry, channel),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// GET /ws/{user_id}
async fn ws_user(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let registry = state.hub.per_user().clone();
    match registry.channel_for(Some(&user_id)) {
        Ok(channel) => upgrade(ws, state, registry, channel),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

/// POST /api/broadcast
async fn broadcast(State(state): State<AppState>, Json(body): Json<BroadcastBody>) -> Response {
    let target = match body.target() {
        Ok(target) => target,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.hub.dispatch(&target, &body.message).await {
        Ok(channel) => (
            StatusCode::ACCEPTED,
            Json(BroadcastAccepted {
                channel: channel.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    let channels = state.hub.stats().await;
    let store = state.store.backend_name();

    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store,
                error: None,
                channels,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                store,
                error: Some(e.to_string()),
                channels,
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Server
// ============================================================================

/// Bound HTTP/WebSocket server.
pub struct RelayServer {
    listener: TcpListener,
    router: Router,
    hub: Hub,
    cancel_token: CancellationToken,
}

impl RelayServer {
    /// Binds `addr`. Use port 0 to let the OS pick one.
    pub async fn bind(addr: SocketAddr, state: AppState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            hub: state.hub.clone(),
            cancel_token: state.shutdown.clone(),
            router: build_router(state),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::Serve)
    }

    /// Serves until the shutdown token fires, then closes every channel.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(%addr, "Relay server listening");

        let cancel = self.cancel_token.clone();
        let served = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;

        self.hub.shutdown().await;
        info!("Relay server stopped");
        served.map_err(ServerError::Serve)
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}
