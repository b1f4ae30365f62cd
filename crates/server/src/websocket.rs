//! WebSocket handling, the server side of the connection transport.
//!
//! One reader loop per socket feeds the owner actor in arrival order; one
//! writer task drains the connection's outbound queue. The reader also runs
//! the server keepalive: a ping every interval, and the socket is dropped as
//! soon as one ping goes unanswered.

use std::ops::ControlFlow;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tether_protocol::{ClientMessage, ServerMessage};
use tether_stream_core::{PingAction, PingTracker};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::outbound::{self, OutboundMessage, OutboundQueue, OutboundReceiver};
use crate::owner::ConnectionId;
use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = outbound::channel(state.config.ephemeral_drop_threshold);

    let Some(conn_id) = state.owner.attach(outbound_tx.clone()).await else {
        error!(
            component = "websocket",
            event = "ws.connection.attach_failed",
            "Owner unavailable, closing socket"
        );
        return;
    };
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = %conn_id,
        "WebSocket connection opened"
    );
    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, conn_id));

    let period = state.config.ping_interval();
    let mut ping_tick = interval_at(Instant::now() + period, period);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pings = PingTracker::new(state.config.server_max_missed_pongs);

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                let flow = read_frame(frame, conn_id, &outbound_tx, &mut pings);
                match flow {
                    ControlFlow::Continue(Some(message)) => {
                        state.owner.client_message(conn_id, message).await;
                    }
                    ControlFlow::Continue(None) => {}
                    ControlFlow::Break(()) => break,
                }
            }
            _ = ping_tick.tick() => match pings.on_tick() {
                PingAction::SendPing => {
                    outbound_tx.send(OutboundMessage::Ping(Bytes::from_static(b"tether")));
                }
                PingAction::PeerDead { missed } => {
                    warn!(
                        component = "websocket",
                        event = "ws.keepalive.dead",
                        connection_id = %conn_id,
                        missed,
                        "Pong not received, terminating socket"
                    );
                    break;
                }
            },
        }
    }

    state.owner.detach(conn_id).await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = %conn_id,
        "WebSocket connection closed"
    );
    writer.abort();
}

/// Drain the connection's outbound queue onto the socket.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: OutboundReceiver,
    conn_id: ConnectionId,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        let frame = match outbound {
            OutboundMessage::Json(message) => match serde_json::to_string(&message) {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    error!(
                        component = "websocket",
                        event = "ws.send.serialize_failed",
                        connection_id = %conn_id,
                        error = %e,
                        "Failed to serialize server message"
                    );
                    continue;
                }
            },
            OutboundMessage::Ping(data) => Message::Ping(data),
            OutboundMessage::Pong(data) => Message::Pong(data),
            OutboundMessage::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
        };
        if ws_tx.send(frame).await.is_err() {
            debug!(
                component = "websocket",
                event = "ws.send.disconnected",
                connection_id = %conn_id,
                "Socket write failed, peer gone"
            );
            return;
        }
    }
}

/// Decode one inbound frame. Control frames are answered here; protocol
/// messages are handed back for the owner.
fn read_frame(
    frame: Result<Message, axum::Error>,
    conn_id: ConnectionId,
    outbound_tx: &OutboundQueue,
    pings: &mut PingTracker,
) -> ControlFlow<(), Option<ClientMessage>> {
    let text = match frame {
        Ok(Message::Text(text)) => text,
        Ok(Message::Ping(data)) => {
            outbound_tx.send(OutboundMessage::Pong(data));
            return ControlFlow::Continue(None);
        }
        Ok(Message::Pong(_)) => {
            pings.on_pong();
            return ControlFlow::Continue(None);
        }
        Ok(Message::Binary(_)) => return ControlFlow::Continue(None),
        Ok(Message::Close(_)) => {
            debug!(
                component = "websocket",
                event = "ws.connection.close_frame",
                connection_id = %conn_id,
                "Client sent close frame"
            );
            return ControlFlow::Break(());
        }
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.connection.error",
                connection_id = %conn_id,
                error = %e,
                "WebSocket error"
            );
            return ControlFlow::Break(());
        }
    };

    match serde_json::from_str::<ClientMessage>(text.as_str()) {
        Ok(message) => {
            debug!(
                component = "websocket",
                event = "ws.message.received",
                connection_id = %conn_id,
                request_id = %message.request_id(),
                "Received client message"
            );
            ControlFlow::Continue(Some(message))
        }
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = %conn_id,
                error = %e,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text.as_str(), 240),
                "Failed to parse client message"
            );
            outbound_tx.send_json(ServerMessage::Error {
                code: "parse_error".into(),
                message: e.to_string(),
                session_id: None,
                request_id: None,
            });
            ControlFlow::Continue(None)
        }
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
