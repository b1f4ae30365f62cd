//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names delivered to sessions subscribed at `notifications` level.
pub const NOTIFICATION_EVENTS: &[&str] = &[
    "agent_start",
    "agent_end",
    "permission_request",
    "permission_expired",
    "session_ended",
    "error",
    "stop_confirmed",
];

/// How much of a session's stream a connection wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionLevel {
    Full,
    Notifications,
}

impl SubscriptionLevel {
    /// Whether an event with this name reaches a subscriber at this level.
    pub fn admits(&self, event_name: &str) -> bool {
        match self {
            SubscriptionLevel::Full => true,
            SubscriptionLevel::Notifications => is_notification_event(event_name),
        }
    }
}

/// Durable events are sequenced and replayable; ephemeral events are live-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Durable,
    Ephemeral,
}

/// Delivery stage of a client turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Accepted,
    Dispatched,
    Completed,
}

/// Turn command flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Prompt,
    Steer,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::Prompt => "prompt",
            TurnKind::Steer => "steer",
        }
    }
}

pub fn is_notification_event(name: &str) -> bool {
    NOTIFICATION_EVENTS.contains(&name)
}

/// Agent activity as reported by the agent host, before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub name: String,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl AgentEvent {
    pub fn durable(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            kind: EventKind::Durable,
            payload,
        }
    }

    pub fn ephemeral(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            kind: EventKind::Ephemeral,
            payload,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.kind == EventKind::Durable
    }
}

/// An event as it travels on the wire.
///
/// `seq` is the per-session sequence number and `stream_seq` the owner-wide one.
/// Both are present only for durable events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_seq: Option<u64>,
    pub name: String,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

impl SequencedEvent {
    /// Wrap a durable event with its assigned sequence numbers.
    pub fn sequenced(session_id: &str, seq: u64, stream_seq: u64, event: AgentEvent) -> Self {
        Self {
            session_id: session_id.to_string(),
            seq: Some(seq),
            stream_seq: Some(stream_seq),
            name: event.name,
            kind: EventKind::Durable,
            payload: event.payload,
        }
    }

    /// Wrap an ephemeral event; it carries no sequence numbers.
    pub fn unsequenced(session_id: &str, event: AgentEvent) -> Self {
        Self {
            session_id: session_id.to_string(),
            seq: None,
            stream_seq: None,
            name: event.name,
            kind: event.kind,
            payload: event.payload,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.kind == EventKind::Durable
    }

    pub fn is_notification(&self) -> bool {
        is_notification_event(&self.name)
    }
}

/// Full current state of a session, served by the bulk resync path.
///
/// `state` reflects exactly the durable events up to and including `current_seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub current_seq: u64,
    #[serde(default)]
    pub state: Value,
}
