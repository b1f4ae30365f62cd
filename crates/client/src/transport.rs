//! Client side of the connection transport.
//!
//! A thin wrapper over a tokio-tungstenite stream: connect with the bearer
//! token, send protocol messages and pings, yield decoded inbound frames.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tether_protocol::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the engine sees from the socket.
#[derive(Debug)]
pub enum Inbound {
    Message(ServerMessage),
    Pong,
    /// Peer closed, or the stream ended.
    Closed,
}

pub struct Transport {
    ws: WsStream,
}

impl Transport {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let mut request = config.ws_url().into_client_request()?;
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ClientError::Config(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let timeout = config.stream.subscribe_timeout();
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::ConnectTimeout(timeout))??;
        debug!(
            component = "transport",
            event = "transport.connected",
            url = %config.ws_url(),
            "WebSocket connected"
        );
        Ok(Self { ws })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.ws.send(Message::Ping(Bytes::from_static(b"tether"))).await?;
        Ok(())
    }

    /// Next meaningful inbound frame. Pings are answered here.
    pub async fn recv(&mut self) -> Result<Inbound> {
        loop {
            let Some(frame) = self.ws.next().await else {
                return Ok(Inbound::Closed);
            };
            match frame? {
                Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => return Ok(Inbound::Message(message)),
                    Err(e) => {
                        warn!(
                            component = "transport",
                            event = "transport.message.parse_failed",
                            error = %e,
                            payload_bytes = text.len(),
                            "Failed to parse server message"
                        );
                    }
                },
                Message::Ping(data) => {
                    self.ws.send(Message::Pong(data)).await?;
                }
                Message::Pong(_) => return Ok(Inbound::Pong),
                Message::Close(_) => return Ok(Inbound::Closed),
                Message::Binary(_) | Message::Frame(_) => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
