#![forbid(unsafe_code)]

//! AstroBeam signaling relay.
//!
//! Peers connect over WebSocket, join a session by its code, and the relay
//! forwards their opaque signaling payloads to everyone else in that
//! session. File data never passes through here.

pub mod session;
pub mod signal;

use std::future::Future;
use std::net::SocketAddr;

use axum::{
    extract::State,
    http::{header, Method},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use session::{SessionTable, SharedSessions};

/// Default upper bound on one inbound WebSocket message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct RelayState {
    pub sessions: SharedSessions,
    pub max_message_bytes: usize,
}

impl RelayState {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            sessions: SessionTable::shared(),
            max_message_bytes,
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    active_sessions: usize,
    active_endpoints: usize,
}

async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    let table = state.sessions.read().await;
    Json(HealthReport {
        active_sessions: table.len(),
        active_endpoints: table.total_endpoints(),
    })
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// WebSocket upgrades on `/` and `/ws`, plus `GET /health`.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(signal::ws_handler))
        .route("/ws", get(signal::ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
