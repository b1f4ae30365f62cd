//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{SubscriptionLevel, TurnKind};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    Subscribe {
        session_id: String,
        level: SubscriptionLevel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since_seq: Option<u64>,
        request_id: String,
    },
    Unsubscribe {
        session_id: String,
        request_id: String,
    },
    /// Owner-wide notification catch-up across sessions.
    ResumeStream {
        since_stream_seq: u64,
        request_id: String,
    },

    // Turns (idempotent by client_turn_id)
    Prompt {
        session_id: String,
        client_turn_id: String,
        request_id: String,
        message: String,
    },
    Steer {
        session_id: String,
        client_turn_id: String,
        request_id: String,
        message: String,
    },

    // Probes
    GetState {
        session_id: String,
        request_id: String,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> &str {
        match self {
            ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Unsubscribe { request_id, .. }
            | ClientMessage::ResumeStream { request_id, .. }
            | ClientMessage::Prompt { request_id, .. }
            | ClientMessage::Steer { request_id, .. }
            | ClientMessage::GetState { request_id, .. } => request_id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Subscribe { session_id, .. }
            | ClientMessage::Unsubscribe { session_id, .. }
            | ClientMessage::Prompt { session_id, .. }
            | ClientMessage::Steer { session_id, .. }
            | ClientMessage::GetState { session_id, .. } => Some(session_id),
            ClientMessage::ResumeStream { .. } => None,
        }
    }

    /// Extract the idempotency envelope of a turn command.
    pub fn as_turn(&self) -> Option<TurnCommand> {
        let (kind, session_id, client_turn_id, request_id, message) = match self {
            ClientMessage::Prompt {
                session_id,
                client_turn_id,
                request_id,
                message,
            } => (TurnKind::Prompt, session_id, client_turn_id, request_id, message),
            ClientMessage::Steer {
                session_id,
                client_turn_id,
                request_id,
                message,
            } => (TurnKind::Steer, session_id, client_turn_id, request_id, message),
            _ => return None,
        };
        Some(TurnCommand {
            kind,
            session_id: session_id.clone(),
            client_turn_id: client_turn_id.clone(),
            request_id: request_id.clone(),
            message: message.clone(),
        })
    }
}

/// A turn command, independent of its wire variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCommand {
    pub kind: TurnKind,
    pub session_id: String,
    pub client_turn_id: String,
    pub request_id: String,
    pub message: String,
}

impl TurnCommand {
    pub fn into_message(self) -> ClientMessage {
        match self.kind {
            TurnKind::Prompt => ClientMessage::Prompt {
                session_id: self.session_id,
                client_turn_id: self.client_turn_id,
                request_id: self.request_id,
                message: self.message,
            },
            TurnKind::Steer => ClientMessage::Steer {
                session_id: self.session_id,
                client_turn_id: self.client_turn_id,
                request_id: self.request_id,
                message: self.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_omits_absent_since_seq() {
        let msg = ClientMessage::Subscribe {
            session_id: "s1".into(),
            level: SubscriptionLevel::Full,
            since_seq: None,
            request_id: "r1".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        assert!(json.contains("\"level\":\"full\""));
        assert!(!json.contains("since_seq"));
    }

    #[test]
    fn parses_subscribe_with_since_seq() {
        let raw = r#"{"type":"subscribe","session_id":"s1","level":"notifications","since_seq":42,"request_id":"r9"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                session_id: "s1".into(),
                level: SubscriptionLevel::Notifications,
                since_seq: Some(42),
                request_id: "r9".into(),
            }
        );
    }

    #[test]
    fn steer_extracts_turn_envelope() {
        let msg = ClientMessage::Steer {
            session_id: "s1".into(),
            client_turn_id: "t1".into(),
            request_id: "r1".into(),
            message: "go left".into(),
        };
        let turn = msg.as_turn().expect("steer is a turn");
        assert_eq!(turn.kind, TurnKind::Steer);
        assert_eq!(turn.client_turn_id, "t1");
        assert_eq!(turn.into_message(), msg);
        assert!(ClientMessage::GetState {
            session_id: "s1".into(),
            request_id: "r2".into()
        }
        .as_turn()
        .is_none());
    }
}
