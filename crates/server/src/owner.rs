//! Owner actor: the single consumer of everything that mutates the stream.
//!
//! Inbound client frames, agent events and turn progress all arrive on one
//! mpsc channel and are applied in order to the `SessionMultiplexer`.
//! Callers talk to it through `OwnerHandle`; status reads go through an
//! `ArcSwap` snapshot republished after every command.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tether_protocol::{
    commands, AgentEvent, ClientMessage, ServerMessage, SessionSnapshot, SubscribeData,
    TurnStage,
};
use tether_stream_core::{StreamConfig, StreamError, SubmitOutcome};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::agent::AgentRequest;
use crate::multiplexer::{SessionMultiplexer, SessionStatus};
use crate::outbound::OutboundQueue;
use crate::snapshot::SnapshotReducer;

/// Identifies one attached connection. Bumped on every attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock-free status view for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OwnerStatus {
    pub attached: bool,
    pub connection: ConnectionId,
    pub stream_seq: u64,
    pub turn_cache_len: usize,
    pub sessions: Vec<SessionStatus>,
}

pub enum OwnerCommand {
    Attach {
        outbound: OutboundQueue,
        reply: oneshot::Sender<ConnectionId>,
    },
    Detach {
        connection: ConnectionId,
    },
    Client {
        connection: ConnectionId,
        message: ClientMessage,
    },
    Publish {
        session_id: String,
        event: AgentEvent,
    },
    AdvanceTurn {
        session_id: String,
        client_turn_id: String,
        stage: TurnStage,
    },
    Snapshot {
        session_id: String,
        reply: oneshot::Sender<Result<SessionSnapshot, StreamError>>,
    },
}

/// Handle to the running owner actor (cheap to Clone).
#[derive(Clone)]
pub struct OwnerHandle {
    command_tx: mpsc::Sender<OwnerCommand>,
    status: Arc<ArcSwap<OwnerStatus>>,
}

impl OwnerHandle {
    /// Spawn the owner actor. Accepted turns are forwarded on `agent_tx`.
    pub fn spawn(
        config: &StreamConfig,
        reducer: Box<dyn SnapshotReducer>,
        agent_tx: mpsc::UnboundedSender<AgentRequest>,
    ) -> OwnerHandle {
        let (command_tx, command_rx) = mpsc::channel(1024);
        let status = Arc::new(ArcSwap::from_pointee(OwnerStatus::default()));
        let owner = Owner {
            mux: SessionMultiplexer::new(config, reducer),
            attached: None,
            next_connection: 0,
            agent_tx,
            status: status.clone(),
        };
        tokio::spawn(owner.run(command_rx));
        OwnerHandle { command_tx, status }
    }

    async fn send(&self, command: OwnerCommand) -> bool {
        if self.command_tx.send(command).await.is_err() {
            warn!(
                component = "owner",
                event = "owner.channel.closed",
                "Owner channel closed, command dropped"
            );
            return false;
        }
        true
    }

    /// Attach a connection, replacing whichever was attached before.
    pub async fn attach(&self, outbound: OutboundQueue) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        if !self.send(OwnerCommand::Attach { outbound, reply }).await {
            return None;
        }
        rx.await.ok()
    }

    pub async fn detach(&self, connection: ConnectionId) {
        self.send(OwnerCommand::Detach { connection }).await;
    }

    pub async fn client_message(&self, connection: ConnectionId, message: ClientMessage) {
        self.send(OwnerCommand::Client {
            connection,
            message,
        })
        .await;
    }

    pub async fn publish(&self, session_id: &str, event: AgentEvent) {
        self.send(OwnerCommand::Publish {
            session_id: session_id.to_string(),
            event,
        })
        .await;
    }

    pub async fn advance_turn(&self, session_id: &str, client_turn_id: &str, stage: TurnStage) {
        self.send(OwnerCommand::AdvanceTurn {
            session_id: session_id.to_string(),
            client_turn_id: client_turn_id.to_string(),
            stage,
        })
        .await;
    }

    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, StreamError> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .send(OwnerCommand::Snapshot {
                session_id: session_id.to_string(),
                reply,
            })
            .await;
        if !sent {
            return Err(StreamError::Transport("owner stopped".into()));
        }
        rx.await
            .map_err(|_| StreamError::Transport("owner stopped".into()))?
    }

    /// Lock-free status read.
    pub fn status(&self) -> Arc<OwnerStatus> {
        self.status.load_full()
    }
}

struct Attached {
    id: ConnectionId,
    outbound: OutboundQueue,
}

struct Owner {
    mux: SessionMultiplexer,
    attached: Option<Attached>,
    next_connection: u64,
    agent_tx: mpsc::UnboundedSender<AgentRequest>,
    status: Arc<ArcSwap<OwnerStatus>>,
}

impl Owner {
    async fn run(mut self, mut command_rx: mpsc::Receiver<OwnerCommand>) {
        while let Some(command) = command_rx.recv().await {
            self.handle(command);
            self.publish_status();
        }
        debug!(
            component = "owner",
            event = "owner.stopped",
            "Owner actor stopped"
        );
    }

    fn handle(&mut self, command: OwnerCommand) {
        match command {
            OwnerCommand::Attach { outbound, reply } => {
                let id = self.attach(outbound);
                let _ = reply.send(id);
            }
            OwnerCommand::Detach { connection } => self.detach(connection),
            OwnerCommand::Client {
                connection,
                message,
            } => {
                let Some(outbound) = self.outbound_for(connection) else {
                    debug!(
                        component = "owner",
                        event = "owner.client.stale_connection",
                        connection_id = %connection,
                        "Ignoring frame from replaced connection"
                    );
                    return;
                };
                self.handle_client(&outbound, message);
            }
            OwnerCommand::Publish { session_id, event } => {
                let published = self.mux.publish(&session_id, event);
                if published.deliver {
                    if let Some(attached) = &self.attached {
                        attached.outbound.send_event(published.event);
                    }
                }
            }
            OwnerCommand::AdvanceTurn {
                session_id,
                client_turn_id,
                stage,
            } => {
                let held = self.mux.advance_turn(&client_turn_id, stage);
                if held != Some(stage) {
                    debug!(
                        component = "owner",
                        event = "owner.turn.advance_ignored",
                        session_id = %session_id,
                        client_turn_id = %client_turn_id,
                        requested = ?stage,
                        held = ?held,
                        "Turn stage did not move"
                    );
                    return;
                }
                if let Some(attached) = &self.attached {
                    attached.outbound.send_json(ServerMessage::TurnAck {
                        session_id,
                        client_turn_id,
                        request_id: None,
                        stage,
                        duplicate: false,
                    });
                }
            }
            OwnerCommand::Snapshot { session_id, reply } => {
                let _ = reply.send(self.mux.snapshot(&session_id));
            }
        }
    }

    fn attach(&mut self, outbound: OutboundQueue) -> ConnectionId {
        self.next_connection += 1;
        let id = ConnectionId(self.next_connection);
        if let Some(previous) = self.attached.take() {
            info!(
                component = "owner",
                event = "owner.connection.replaced",
                previous = %previous.id,
                connection_id = %id,
                "New connection replaces the attached one"
            );
            previous.outbound.close();
        }
        self.mux.detach_connection();
        self.attached = Some(Attached { id, outbound });
        id
    }

    fn detach(&mut self, connection: ConnectionId) {
        match &self.attached {
            Some(attached) if attached.id == connection => {
                self.attached = None;
                self.mux.detach_connection();
                info!(
                    component = "owner",
                    event = "owner.connection.detached",
                    connection_id = %connection,
                    "Connection detached"
                );
            }
            _ => debug!(
                component = "owner",
                event = "owner.connection.stale_detach",
                connection_id = %connection,
                "Ignoring detach from replaced connection"
            ),
        }
    }

    fn outbound_for(&self, connection: ConnectionId) -> Option<OutboundQueue> {
        self.attached
            .as_ref()
            .filter(|attached| attached.id == connection)
            .map(|attached| attached.outbound.clone())
    }

    fn handle_client(&mut self, outbound: &OutboundQueue, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe {
                session_id,
                level,
                since_seq,
                request_id,
            } => {
                let outcome = self.mux.subscribe(&session_id, level, since_seq);
                info!(
                    component = "owner",
                    event = "owner.subscribe",
                    session_id = %session_id,
                    level = ?level,
                    since_seq = ?since_seq,
                    current_seq = outcome.current_seq,
                    catch_up_complete = outcome.catch_up_complete,
                    replay_count = outcome.replay.len(),
                    "Session subscribed"
                );
                outbound.send_json(ServerMessage::rpc_ok(
                    commands::SUBSCRIBE,
                    &request_id,
                    SubscribeData {
                        current_seq: outcome.current_seq,
                        catch_up_complete: outcome.catch_up_complete,
                    },
                ));
                for event in outcome.replay {
                    outbound.send_event(event);
                }
            }

            ClientMessage::Unsubscribe {
                session_id,
                request_id,
            } => match self.mux.unsubscribe(&session_id) {
                Ok(()) => {
                    outbound.send_json(ServerMessage::rpc_ok(
                        commands::UNSUBSCRIBE,
                        &request_id,
                        serde_json::json!({ "session_id": session_id }),
                    ));
                }
                Err(err) => send_error(outbound, &err, &request_id),
            },

            ClientMessage::ResumeStream {
                since_stream_seq,
                request_id,
            } => {
                let (data, events) = self.mux.resume_stream(since_stream_seq);
                outbound.send_json(ServerMessage::rpc_ok(
                    commands::RESUME_STREAM,
                    &request_id,
                    data,
                ));
                for event in events {
                    outbound.send_event(event);
                }
            }

            ClientMessage::GetState {
                ref session_id,
                ref request_id,
            } => match self.mux.route(&message) {
                Ok(_) => {
                    outbound.send_json(ServerMessage::rpc_ok(
                        commands::GET_STATE,
                        request_id,
                        self.mux.state_probe(session_id),
                    ));
                }
                Err(err) => send_error(outbound, &err, request_id),
            },

            ClientMessage::Prompt { .. } | ClientMessage::Steer { .. } => {
                if let Err(err) = self.mux.route(&message) {
                    send_error(outbound, &err, message.request_id());
                    return;
                }
                let Some(turn) = message.as_turn() else {
                    return;
                };
                match self.mux.submit_turn(&turn) {
                    SubmitOutcome::Accept => {
                        info!(
                            component = "owner",
                            event = "owner.turn.accepted",
                            session_id = %turn.session_id,
                            client_turn_id = %turn.client_turn_id,
                            kind = turn.kind.as_str(),
                            "Turn accepted"
                        );
                        outbound.send_json(ServerMessage::TurnAck {
                            session_id: turn.session_id.clone(),
                            client_turn_id: turn.client_turn_id.clone(),
                            request_id: Some(turn.request_id.clone()),
                            stage: TurnStage::Accepted,
                            duplicate: false,
                        });
                        if self.agent_tx.send(AgentRequest::from(turn)).is_err() {
                            warn!(
                                component = "owner",
                                event = "owner.agent.unavailable",
                                "Agent host gone, accepted turn not dispatched"
                            );
                        }
                    }
                    SubmitOutcome::Duplicate(stage) => {
                        debug!(
                            component = "owner",
                            event = "owner.turn.duplicate",
                            session_id = %turn.session_id,
                            client_turn_id = %turn.client_turn_id,
                            stage = ?stage,
                            "Duplicate turn collapsed"
                        );
                        outbound.send_json(ServerMessage::TurnAck {
                            session_id: turn.session_id,
                            client_turn_id: turn.client_turn_id,
                            request_id: Some(turn.request_id),
                            stage,
                            duplicate: true,
                        });
                    }
                    SubmitOutcome::Conflict => {
                        warn!(
                            component = "owner",
                            event = "owner.turn.conflict",
                            session_id = %turn.session_id,
                            client_turn_id = %turn.client_turn_id,
                            "Turn id reused with a different payload"
                        );
                        let err = StreamError::TurnConflict {
                            client_turn_id: turn.client_turn_id,
                        };
                        outbound.send_json(ServerMessage::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                            session_id: Some(turn.session_id),
                            request_id: Some(turn.request_id),
                        });
                    }
                }
            }
        }
    }

    fn publish_status(&self) {
        self.status.store(Arc::new(OwnerStatus {
            attached: self.attached.is_some(),
            connection: self
                .attached
                .as_ref()
                .map(|attached| attached.id)
                .unwrap_or_default(),
            stream_seq: self.mux.stream_seq(),
            turn_cache_len: self.mux.turn_cache_len(),
            sessions: self.mux.sessions_status(),
        }));
    }
}

fn send_error(outbound: &OutboundQueue, err: &StreamError, request_id: &str) {
    outbound.send_json(ServerMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
        session_id: err.session_id().map(str::to_string),
        request_id: Some(request_id.to_string()),
    });
}
