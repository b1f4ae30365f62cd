//! Error taxonomy for the session stream.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Connect/send/receive failure. Recovered by transport-level reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// The ring cannot serve a replay. Recovered by bulk resync.
    #[error("sequence gap for session {session_id}: since {since_seq}, retained {oldest_retained}..={current_seq}")]
    SequenceGap {
        session_id: String,
        since_seq: u64,
        oldest_retained: u64,
        current_seq: u64,
    },

    /// Idempotency key reused with a different payload.
    #[error("turn {client_turn_id} was already submitted with a different payload")]
    TurnConflict { client_turn_id: String },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Internal trigger for a forced session-level reconnect.
    #[error("session {session_id} silent for {silent_for:?} during an active turn")]
    WatchdogTimeout {
        session_id: String,
        silent_for: Duration,
    },
}

impl StreamError {
    /// Stable code used in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Transport(_) => "transport_error",
            StreamError::SequenceGap { .. } => "sequence_gap",
            StreamError::TurnConflict { .. } => "turn_conflict",
            StreamError::UnknownSession(_) => "unknown_session",
            StreamError::WatchdogTimeout { .. } => "watchdog_timeout",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamError::SequenceGap { session_id, .. }
            | StreamError::WatchdogTimeout { session_id, .. }
            | StreamError::UnknownSession(session_id) => Some(session_id),
            StreamError::Transport(_) | StreamError::TurnConflict { .. } => None,
        }
    }
}
