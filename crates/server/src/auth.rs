//! Optional bearer-token middleware.
//!
//! When a token is configured, `/ws` and `/api/*` require
//! `Authorization: Bearer <token>` or `?token=<token>` (WebSocket clients
//! that cannot set headers). `/health` stays open.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

pub async fn auth_middleware(
    State(expected_token): State<String>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let header_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if header_token == Some(expected_token.as_str()) {
        return Ok(next.run(req).await);
    }

    let query_token = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
    });
    if query_token == Some(expected_token.as_str()) {
        return Ok(next.run(req).await);
    }

    debug!(
        component = "auth",
        event = "auth.rejected",
        path = %path,
        "Rejected request without a valid token"
    );
    Err(StatusCode::UNAUTHORIZED)
}
