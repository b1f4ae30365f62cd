//! Bulk resynchronization: fetch a session's full current state over HTTP.

use tether_protocol::SessionSnapshot;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::Result;

pub async fn fetch_snapshot(
    http: &reqwest::Client,
    config: &ClientConfig,
    session_id: &str,
) -> Result<SessionSnapshot> {
    let url = format!("{}/api/sessions/{}/state", config.http_base(), session_id);
    let mut request = http.get(&url);
    if let Some(token) = &config.auth_token {
        request = request.bearer_auth(token);
    }
    let snapshot: SessionSnapshot = request.send().await?.error_for_status()?.json().await?;
    debug!(
        component = "resync",
        event = "resync.snapshot.fetched",
        session_id = %session_id,
        current_seq = snapshot.current_seq,
        "Fetched session snapshot"
    );
    Ok(snapshot)
}
