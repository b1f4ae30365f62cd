//! HTTP endpoints: health, status, bulk resync.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tether_stream_core::StreamError;
use tracing::warn;

use crate::state::AppState;

pub async fn health_handler() -> impl IntoResponse {
    "OK"
}

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.owner.status().as_ref().clone())
}

/// Full current state of one session, for clients whose catch-up fell
/// outside the replay ring.
pub async fn session_state_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.owner.snapshot(&session_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: StreamError) -> Response {
    let status = match err {
        StreamError::UnknownSession(_) => StatusCode::NOT_FOUND,
        _ => {
            warn!(
                component = "api",
                event = "api.snapshot.failed",
                error = %err,
                "Snapshot request failed"
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (
        status,
        Json(json!({ "code": err.code(), "message": err.to_string() })),
    )
        .into_response()
}
