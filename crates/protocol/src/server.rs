//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{SequencedEvent, SubscriptionLevel, TurnStage};

/// RPC command names echoed back in `rpc_result`.
pub mod commands {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const RESUME_STREAM: &str = "resume_stream";
    pub const GET_STATE: &str = "get_state";
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event(SequencedEvent),
    RpcResult(RpcResult),
    TurnAck {
        session_id: String,
        client_turn_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        stage: TurnStage,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        duplicate: bool,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Request that caused the error, when there is one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn rpc_ok(command: &str, request_id: &str, data: impl Serialize) -> Self {
        ServerMessage::RpcResult(RpcResult {
            command: command.to_string(),
            request_id: request_id.to_string(),
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        })
    }

    pub fn rpc_err(command: &str, request_id: &str, error: impl Into<String>) -> Self {
        ServerMessage::RpcResult(RpcResult {
            command: command.to_string(),
            request_id: request_id.to_string(),
            success: false,
            data: None,
            error: Some(error.into()),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Event(event) => Some(&event.session_id),
            ServerMessage::TurnAck { session_id, .. } => Some(session_id),
            ServerMessage::Error { session_id, .. } => session_id.as_deref(),
            ServerMessage::RpcResult(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub command: String,
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResult {
    /// Decode `data` into a typed payload.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.data
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

/// `rpc_result.data` for `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeData {
    pub current_seq: u64,
    pub catch_up_complete: bool,
}

/// `rpc_result.data` for `resume_stream`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeStreamData {
    pub current_stream_seq: u64,
    pub catch_up_complete: bool,
}

/// `rpc_result.data` for `get_state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProbeData {
    pub session_id: String,
    pub current_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<SubscriptionLevel>,
    pub busy: bool,
}
