//! Tether server
//!
//! The owner side of the session stream: one WebSocket connection at a time,
//! many sessions multiplexed over it, durable events sequenced into replay
//! rings, turns deduplicated before they reach the agent host.

pub mod agent;
pub mod api;
pub mod auth;
pub mod config;
pub mod logging;
pub mod multiplexer;
pub mod outbound;
pub mod owner;
pub mod paths;
pub mod snapshot;
pub mod state;
pub mod websocket;

use std::time::Duration;

use axum::{middleware, routing::get, Router};
use tether_stream_core::StreamConfig;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::agent::EchoAgent;
use crate::owner::OwnerHandle;
use crate::snapshot::TranscriptReducer;
use crate::state::AppState;

/// Spawn the owner actor and the loopback agent, and build the router.
pub fn build_app(
    config: StreamConfig,
    auth_token: Option<String>,
    echo_delay: Duration,
) -> (Router, OwnerHandle) {
    let (agent_tx, agent_rx) = mpsc::unbounded_channel();
    let owner = OwnerHandle::spawn(&config, Box::new(TranscriptReducer), agent_tx);
    EchoAgent::new(owner.clone(), echo_delay).spawn(agent_rx);

    (router(AppState::new(owner.clone(), config), auth_token), owner)
}

pub fn router(state: AppState, auth_token: Option<String>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(api::health_handler))
        .route("/api/status", get(api::status_handler))
        .route(
            "/api/sessions/{session_id}/state",
            get(api::session_state_handler),
        )
        .with_state(state);

    if let Some(token) = auth_token {
        app = app.layer(middleware::from_fn_with_state(token, auth::auth_middleware));
    }

    app.layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
