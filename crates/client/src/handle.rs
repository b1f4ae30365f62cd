//! Public face of the client engine.

use tether_protocol::{SequencedEvent, SessionSnapshot, SubscriptionLevel, TurnKind, TurnStage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::engine::Engine;
use crate::error::{ClientError, Result};
use crate::seq_store::SeqStore;

/// Physical connection liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Connecting,
    Reconnecting,
    Disconnected,
}

/// What the consumer should render. Reconnecting is `Syncing`, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Live,
    Syncing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: LinkState,
    pub phase: SyncPhase,
    /// Transport reconnect attempt, 0 while connected.
    pub attempt: u32,
    pub last_activity: Option<Instant>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Connecting,
            phase: SyncPhase::Syncing,
            attempt: 0,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Durable(SequencedEvent),
    /// Coalesced batch of live-only events.
    Ephemeral(Vec<SequencedEvent>),
    /// Session state replaced wholesale by a snapshot.
    Resynced(SessionSnapshot),
    TurnAck {
        session_id: String,
        client_turn_id: String,
        stage: TurnStage,
        duplicate: bool,
    },
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },
    Connection(ConnectionStatus),
}

pub(crate) enum Command {
    Subscribe {
        session_id: String,
        level: SubscriptionLevel,
    },
    Unsubscribe {
        session_id: String,
    },
    Turn {
        session_id: String,
        kind: TurnKind,
        message: String,
        reply: oneshot::Sender<String>,
    },
    ReconnectNow,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct StreamClient;

impl StreamClient {
    /// Spawn the engine on the current runtime. It starts connecting at once.
    pub fn connect(
        config: ClientConfig,
        store: SeqStore,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let engine = Engine::new(config, store, event_tx, status_tx);
        tokio::spawn(engine.run(command_rx));

        (
            ClientHandle {
                command_tx,
                status: status_rx,
            },
            event_rx,
        )
    }
}

#[derive(Clone)]
pub struct ClientHandle {
    command_tx: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ClientHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ClientError::EngineStopped)
    }

    pub async fn subscribe(&self, session_id: &str, level: SubscriptionLevel) -> Result<()> {
        self.send(Command::Subscribe {
            session_id: session_id.to_string(),
            level,
        })
        .await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> Result<()> {
        self.send(Command::Unsubscribe {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Returns the generated `client_turn_id`.
    pub async fn prompt(&self, session_id: &str, message: &str) -> Result<String> {
        self.turn(session_id, TurnKind::Prompt, message).await
    }

    pub async fn steer(&self, session_id: &str, message: &str) -> Result<String> {
        self.turn(session_id, TurnKind::Steer, message).await
    }

    async fn turn(&self, session_id: &str, kind: TurnKind, message: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Turn {
            session_id: session_id.to_string(),
            kind,
            message: message.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Leave `Disconnected`, or force a fresh connection.
    pub async fn reconnect_now(&self) -> Result<()> {
        self.send(Command::ReconnectNow).await
    }

    /// Flush state to disk and stop the engine.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| ClientError::EngineStopped)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}
