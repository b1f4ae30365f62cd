//! Reduced session state served by the bulk-resync endpoint.
//!
//! The reducer sees every durable event of a session in sequence order,
//! inside the owner actor, so a snapshot's `state` always corresponds to
//! exactly `current_seq`.

use serde_json::{json, Value};
use tether_protocol::SequencedEvent;

pub trait SnapshotReducer: Send + Sync {
    fn initial(&self) -> Value;
    fn apply(&self, state: &mut Value, event: &SequencedEvent);
}

/// Default reducer: busy flag, completed messages, last event name.
#[derive(Debug, Default, Clone, Copy)]
pub struct TranscriptReducer;

impl SnapshotReducer for TranscriptReducer {
    fn initial(&self) -> Value {
        json!({
            "busy": false,
            "messages": [],
            "last_event": null,
        })
    }

    fn apply(&self, state: &mut Value, event: &SequencedEvent) {
        let Some(object) = state.as_object_mut() else {
            return;
        };
        match event.name.as_str() {
            "agent_start" => {
                object.insert("busy".into(), Value::Bool(true));
            }
            "agent_end" | "session_ended" | "stop_confirmed" => {
                object.insert("busy".into(), Value::Bool(false));
            }
            "message_end" => {
                if let Some(Value::Array(messages)) = object.get_mut("messages") {
                    messages.push(event.payload.clone());
                }
            }
            _ => {}
        }
        object.insert("last_event".into(), Value::String(event.name.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_protocol::AgentEvent;

    fn durable(seq: u64, name: &str, payload: Value) -> SequencedEvent {
        SequencedEvent::sequenced("s1", seq, seq, AgentEvent::durable(name, payload))
    }

    #[test]
    fn transcript_tracks_busy_and_messages() {
        let reducer = TranscriptReducer;
        let mut state = reducer.initial();

        reducer.apply(&mut state, &durable(1, "agent_start", Value::Null));
        assert_eq!(state["busy"], json!(true));

        reducer.apply(&mut state, &durable(2, "message_end", json!({"text": "done"})));
        reducer.apply(&mut state, &durable(3, "agent_end", Value::Null));

        assert_eq!(state["busy"], json!(false));
        assert_eq!(state["messages"], json!([{"text": "done"}]));
        assert_eq!(state["last_event"], json!("agent_end"));
    }
}
