//! Agent host seam
//!
//! Accepted turns leave the owner as `AgentRequest`s. Whatever executes them
//! reports back through the `OwnerHandle`: events via `publish`, progress via
//! `advance_turn`. `EchoAgent` is the loopback host used by the binary in
//! development and by the tests.

use std::time::Duration;

use serde_json::json;
use tether_protocol::{AgentEvent, TurnCommand, TurnKind, TurnStage};
use tokio::sync::mpsc;
use tracing::debug;

use crate::owner::OwnerHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub session_id: String,
    pub client_turn_id: String,
    pub kind: TurnKind,
    pub message: String,
}

impl From<TurnCommand> for AgentRequest {
    fn from(turn: TurnCommand) -> Self {
        Self {
            session_id: turn.session_id,
            client_turn_id: turn.client_turn_id,
            kind: turn.kind,
            message: turn.message,
        }
    }
}

/// Echoes each turn back as a short streamed reply.
pub struct EchoAgent {
    owner: OwnerHandle,
    step_delay: Duration,
}

impl EchoAgent {
    pub fn new(owner: OwnerHandle, step_delay: Duration) -> Self {
        Self { owner, step_delay }
    }

    pub fn spawn(self, requests: mpsc::UnboundedReceiver<AgentRequest>) {
        tokio::spawn(self.run(requests));
    }

    async fn run(self, mut requests: mpsc::UnboundedReceiver<AgentRequest>) {
        while let Some(request) = requests.recv().await {
            self.handle(request).await;
        }
    }

    async fn handle(&self, request: AgentRequest) {
        let AgentRequest {
            session_id,
            client_turn_id,
            kind,
            message,
        } = request;
        debug!(
            component = "echo_agent",
            event = "agent.turn.started",
            session_id = %session_id,
            client_turn_id = %client_turn_id,
            "Echo agent handling turn"
        );

        self.owner
            .advance_turn(&session_id, &client_turn_id, TurnStage::Dispatched)
            .await;
        self.owner
            .publish(
                &session_id,
                AgentEvent::durable(
                    "agent_start",
                    json!({ "client_turn_id": client_turn_id, "kind": kind.as_str() }),
                ),
            )
            .await;

        for word in message.split_whitespace() {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            self.owner
                .publish(
                    &session_id,
                    AgentEvent::ephemeral("text_delta", json!({ "delta": format!("{word} ") })),
                )
                .await;
        }

        self.owner
            .publish(
                &session_id,
                AgentEvent::durable(
                    "message_end",
                    json!({
                        "client_turn_id": client_turn_id,
                        "role": "assistant",
                        "text": message,
                    }),
                ),
            )
            .await;
        self.owner
            .publish(
                &session_id,
                AgentEvent::durable("agent_end", json!({ "client_turn_id": client_turn_id })),
            )
            .await;
        self.owner
            .advance_turn(&session_id, &client_turn_id, TurnStage::Completed)
            .await;
    }
}
