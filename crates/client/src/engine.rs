//! Client event loop
//!
//! One task owns the transport, every session's sync state, the pending
//! turns and the coalescer. It reacts to API commands, inbound frames,
//! connect and resync completions and its own timers, strictly one at a
//! time. Connect attempts and snapshot fetches run in spawned tasks and
//! report back tagged with the generation (or epoch) they started under.

use std::collections::HashMap;
use std::time::Duration;

use tether_protocol::{
    commands, new_id, ClientMessage, RpcResult, SequencedEvent, ServerMessage, SessionSnapshot,
    StateProbeData, SubscribeData, SubscriptionLevel, TurnCommand, TurnStage,
};
use tether_stream_core::{
    Generation, PingAction, PingTracker, ReconnectCoordinator, ReconnectPhase, ReconnectStep,
    StreamError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::coalescer::{DeltaCoalescer, Delivery};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::handle::{ClientEvent, Command, ConnectionStatus, LinkState, SyncPhase};
use crate::resync;
use crate::seq_store::SeqStore;
use crate::session_sync::{DurableOutcome, PendingSubscribe, SessionSync, SubscribeVerdict};
use crate::transport::{Inbound, Transport};
use crate::watchdog::WatchdogAction;

const STORE_FLUSH_INTERVAL: Duration = Duration::from_secs(2);

type ConnectResult = (Generation, Result<Transport>);
type ResyncResult = (String, u64, Result<SessionSnapshot>);
type Sink = Box<dyn FnMut(Delivery) + Send>;

pub(crate) struct Engine {
    config: ClientConfig,
    http: reqwest::Client,
    store: SeqStore,
    events: mpsc::UnboundedSender<ClientEvent>,
    status_tx: watch::Sender<ConnectionStatus>,

    coordinator: ReconnectCoordinator,
    connecting: Option<JoinHandle<()>>,
    transport: Option<Transport>,
    pings: PingTracker,
    next_ping: Option<Instant>,
    retry_at: Option<Instant>,
    last_activity: Option<Instant>,
    /// Set when a send or receive fails; handled once per loop turn.
    lost: bool,

    sessions: HashMap<String, SessionSync>,
    /// Keyed by client_turn_id. Held until the `completed` ack.
    turns: HashMap<String, TurnCommand>,
    /// Outstanding state probes: request_id -> session_id.
    probes: HashMap<String, String>,
    coalescer: DeltaCoalescer<Sink>,

    connect_tx: mpsc::UnboundedSender<ConnectResult>,
    connect_rx: mpsc::UnboundedReceiver<ConnectResult>,
    resync_tx: mpsc::UnboundedSender<ResyncResult>,
    resync_rx: mpsc::UnboundedReceiver<ResyncResult>,
}

impl Engine {
    pub(crate) fn new(
        config: ClientConfig,
        store: SeqStore,
        events: mpsc::UnboundedSender<ClientEvent>,
        status_tx: watch::Sender<ConnectionStatus>,
    ) -> Self {
        let sink_tx = events.clone();
        let sink: Sink = Box::new(move |delivery| {
            let event = match delivery {
                Delivery::Durable(event) => ClientEvent::Durable(event),
                Delivery::Ephemeral(batch) => ClientEvent::Ephemeral(batch),
            };
            let _ = sink_tx.send(event);
        });
        let coalescer = DeltaCoalescer::new(
            config.stream.coalesce_interval(),
            config.stream.coalesce_max_events,
            config.stream.coalesce_max_bytes,
            sink,
        );
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();

        Self {
            coordinator: ReconnectCoordinator::new(config.stream.transport_backoff),
            pings: PingTracker::new(config.stream.client_max_missed_pongs),
            http: reqwest::Client::new(),
            config,
            store,
            events,
            status_tx,
            connecting: None,
            transport: None,
            next_ping: None,
            retry_at: None,
            last_activity: None,
            lost: false,
            sessions: HashMap::new(),
            turns: HashMap::new(),
            probes: HashMap::new(),
            coalescer,
            connect_tx,
            connect_rx,
            resync_tx,
            resync_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            component = "client_engine",
            event = "client.engine.started",
            url = %self.config.ws_url(),
            "Client engine started"
        );
        self.begin_connect();
        self.publish_status();

        let mut flush_tick = tokio::time::interval(STORE_FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ping_at = self.next_ping;
            let retry_at = self.retry_at;
            let session_at = self.sessions.values().filter_map(|s| s.next_deadline()).min();
            let coalesce_at = self.coalescer.deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                inbound = recv_inbound(&mut self.transport) => self.handle_inbound(inbound).await,
                Some((generation, result)) = self.connect_rx.recv() => {
                    self.handle_connect_result(generation, result).await;
                }
                Some((session_id, epoch, result)) = self.resync_rx.recv() => {
                    self.handle_resync_result(session_id, epoch, result).await;
                }
                _ = sleep_until(ping_at) => self.handle_ping_tick().await,
                _ = sleep_until(retry_at) => {
                    self.retry_at = None;
                    self.begin_connect();
                }
                _ = sleep_until(session_at) => self.handle_session_timers().await,
                _ = sleep_until(coalesce_at) => self.coalescer.on_tick(Instant::now()),
                _ = flush_tick.tick() => self.flush_store(),
            }

            if self.lost {
                self.lost = false;
                self.handle_connection_lost();
            }
            self.publish_status();
        }
    }

    // Commands

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { session_id, level } => {
                if level == SubscriptionLevel::Full {
                    // The server grants full to one session at a time.
                    for (id, sync) in self.sessions.iter_mut() {
                        if *id != session_id && sync.is_full() {
                            sync.downgrade();
                        }
                    }
                }
                match self.sessions.get_mut(&session_id) {
                    Some(sync) => {
                        sync.level = level;
                        if level == SubscriptionLevel::Notifications {
                            sync.watchdog.disarm();
                        }
                    }
                    None => {
                        let last_seen = self.store.get(&session_id).unwrap_or(0);
                        let sync =
                            SessionSync::new(&session_id, level, last_seen, &self.config.stream);
                        self.sessions.insert(session_id.clone(), sync);
                    }
                }
                self.send_subscribe(&session_id).await;
            }
            Command::Unsubscribe { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    self.probes.retain(|_, id| *id != session_id);
                    // The server drops the session's history on unsubscribe.
                    self.store.remove(&session_id);
                    self.send(ClientMessage::Unsubscribe {
                        session_id,
                        request_id: new_id(),
                    })
                    .await;
                }
            }
            Command::Turn {
                session_id,
                kind,
                message,
                reply,
            } => {
                let command = TurnCommand {
                    kind,
                    session_id,
                    client_turn_id: new_id(),
                    request_id: new_id(),
                    message,
                };
                let client_turn_id = command.client_turn_id.clone();
                // Held until the session's subscribe lands; sent after it.
                let ready = self
                    .sessions
                    .get(&command.session_id)
                    .map_or(true, |sync| sync.subscribed);
                let message = command.clone().into_message();
                self.turns.insert(client_turn_id.clone(), command);
                if ready {
                    self.send(message).await;
                }
                let _ = reply.send(client_turn_id);
            }
            Command::ReconnectNow => {
                info!(
                    component = "client_engine",
                    event = "client.reconnect.requested",
                    phase = ?self.coordinator.phase(),
                    "Reconnect requested"
                );
                self.drop_transport();
                self.coordinator.reset();
                self.begin_connect();
            }
            Command::Shutdown { .. } => {}
        }
    }

    // Transport lifecycle

    fn begin_connect(&mut self) {
        let Some(generation) = self.coordinator.begin_attempt() else {
            return;
        };
        self.retry_at = None;
        if let Some(previous) = self.connecting.take() {
            previous.abort();
        }
        debug!(
            component = "client_engine",
            event = "client.connect.started",
            generation = %generation,
            attempt = self.coordinator.attempt(),
            "Connect attempt started"
        );

        let config = self.config.clone();
        let tx = self.connect_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = Transport::connect(&config).await;
            let _ = tx.send((generation, result));
        }));
    }

    async fn handle_connect_result(&mut self, generation: Generation, result: Result<Transport>) {
        match result {
            Ok(transport) => {
                if !self.coordinator.succeeded(generation) {
                    debug!(
                        component = "client_engine",
                        event = "client.connect.stale",
                        generation = %generation,
                        "Discarding connection from a superseded attempt"
                    );
                    return;
                }
                self.connecting = None;
                let now = Instant::now();
                self.transport = Some(transport);
                self.pings.reset();
                self.next_ping = Some(now + self.config.stream.ping_interval());
                self.last_activity = Some(now);
                info!(
                    component = "client_engine",
                    event = "client.connect.succeeded",
                    generation = %generation,
                    sessions = self.sessions.len(),
                    "Connected"
                );

                let session_ids: Vec<String> = self.sessions.keys().cloned().collect();
                for session_id in session_ids {
                    self.send_subscribe(&session_id).await;
                }
                self.resend_turns(None).await;
            }
            Err(error) => match self.coordinator.failed(generation) {
                ReconnectStep::Retry { attempt, delay } => {
                    warn!(
                        component = "client_engine",
                        event = "client.connect.failed",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Connect failed, retrying"
                    );
                    self.retry_at = Some(Instant::now() + delay);
                }
                ReconnectStep::Exhausted => self.report_exhausted(&error.to_string()),
                ReconnectStep::Stale => {}
            },
        }
    }

    fn handle_connection_lost(&mut self) {
        self.drop_transport();
        match self.coordinator.connection_lost() {
            ReconnectStep::Retry { attempt, delay } => {
                info!(
                    component = "client_engine",
                    event = "client.connection.lost",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost, reconnecting"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            ReconnectStep::Exhausted => self.report_exhausted("connection lost"),
            ReconnectStep::Stale => {}
        }
    }

    fn report_exhausted(&mut self, reason: &str) {
        let error = StreamError::Transport(reason.to_string());
        warn!(
            component = "client_engine",
            event = "client.connect.exhausted",
            attempts = self.coordinator.attempt(),
            error = %error,
            "Giving up until reconnect is requested"
        );
        self.emit(ClientEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            session_id: None,
        });
    }

    /// Tear down everything scoped to the current connection.
    fn drop_transport(&mut self) {
        self.transport = None;
        self.next_ping = None;
        self.pings.reset();
        self.probes.clear();
        for sync in self.sessions.values_mut() {
            sync.teardown();
        }
        self.coalescer.flush();
    }

    async fn send(&mut self, message: ClientMessage) -> bool {
        if self.lost {
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send(&message).await {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    component = "client_engine",
                    event = "client.send.failed",
                    request_id = %message.request_id(),
                    error = %error,
                    "Send failed"
                );
                self.lost = true;
                false
            }
        }
    }

    async fn handle_ping_tick(&mut self) {
        self.next_ping = Some(Instant::now() + self.config.stream.ping_interval());
        match self.pings.on_tick() {
            PingAction::SendPing => {
                if let Some(transport) = self.transport.as_mut() {
                    if let Err(error) = transport.ping().await {
                        warn!(
                            component = "client_engine",
                            event = "client.ping.failed",
                            error = %error,
                            "Ping failed"
                        );
                        self.lost = true;
                    }
                }
            }
            PingAction::PeerDead { missed } => {
                warn!(
                    component = "client_engine",
                    event = "client.ping.peer_dead",
                    missed,
                    "Server stopped answering pings"
                );
                self.lost = true;
            }
        }
    }

    // Inbound

    async fn handle_inbound(&mut self, inbound: Result<Inbound>) {
        match inbound {
            Ok(Inbound::Message(message)) => {
                self.last_activity = Some(Instant::now());
                self.handle_server_message(message).await;
            }
            Ok(Inbound::Pong) => {
                self.last_activity = Some(Instant::now());
                self.pings.on_pong();
            }
            Ok(Inbound::Closed) => {
                info!(
                    component = "client_engine",
                    event = "client.connection.closed",
                    "Server closed the connection"
                );
                self.lost = true;
            }
            Err(error) => {
                warn!(
                    component = "client_engine",
                    event = "client.recv.failed",
                    error = %error,
                    "Receive failed"
                );
                self.lost = true;
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Event(event) => self.handle_event(event).await,
            ServerMessage::RpcResult(result) => match result.command.as_str() {
                commands::SUBSCRIBE => self.handle_subscribe_result(result).await,
                commands::GET_STATE => self.handle_probe_result(result).await,
                _ => {}
            },
            ServerMessage::TurnAck {
                session_id,
                client_turn_id,
                stage,
                duplicate,
                ..
            } => self.handle_turn_ack(session_id, client_turn_id, stage, duplicate),
            ServerMessage::Error {
                code,
                message,
                session_id,
                request_id,
            } => {
                if let Some(request_id) = request_id {
                    if code == "turn_conflict" || code == "unknown_session" {
                        self.turns.retain(|_, turn| turn.request_id != request_id);
                    }
                    self.probes.remove(&request_id);
                }
                warn!(
                    component = "client_engine",
                    event = "client.server_error",
                    code = %code,
                    session_id = ?session_id,
                    error = %message,
                    "Server reported an error"
                );
                self.emit(ClientEvent::Error {
                    code,
                    message,
                    session_id,
                });
            }
        }
    }

    async fn handle_event(&mut self, event: SequencedEvent) {
        let now = Instant::now();
        let session_id = event.session_id.clone();
        let Some(sync) = self.sessions.get_mut(&session_id) else {
            debug!(
                component = "client_engine",
                event = "client.event.untracked",
                session_id = %session_id,
                name = %event.name,
                "Event for a session we do not track"
            );
            return;
        };

        sync.watchdog.on_activity(now);
        match event.name.as_str() {
            "agent_start" if sync.is_full() => sync.watchdog.arm(now),
            "agent_end" | "session_ended" | "stop_confirmed" => sync.watchdog.disarm(),
            _ => {}
        }

        let Some(seq) = event.seq.filter(|_| event.is_durable()) else {
            self.coalescer.receive(event, now);
            return;
        };

        match sync.on_durable(event, seq) {
            DurableOutcome::Deliver(event) => {
                self.store.set(&session_id, seq);
                self.coalescer.receive(event, now);
            }
            DurableOutcome::Buffered => {}
            DurableOutcome::Duplicate => {
                debug!(
                    component = "client_engine",
                    event = "client.event.duplicate",
                    session_id = %session_id,
                    seq,
                    "Discarded duplicate event"
                );
            }
            DurableOutcome::Gap { expected, received } => {
                // A subscribe in flight will replay the missing range.
                let resubscribe = sync.pending_subscribe.is_none();
                debug!(
                    component = "client_engine",
                    event = "client.event.gap",
                    session_id = %session_id,
                    expected,
                    received,
                    resubscribe,
                    "Sequence gap detected"
                );
                if resubscribe {
                    self.send_subscribe(&session_id).await;
                }
            }
        }
    }

    fn handle_turn_ack(
        &mut self,
        session_id: String,
        client_turn_id: String,
        stage: TurnStage,
        duplicate: bool,
    ) {
        if stage == TurnStage::Completed {
            self.turns.remove(&client_turn_id);
        }

        if let Some(sync) = self.sessions.get_mut(&session_id) {
            match stage {
                TurnStage::Accepted if sync.is_full() => sync.watchdog.arm(Instant::now()),
                TurnStage::Completed => sync.watchdog.disarm(),
                _ => {}
            }
        }

        self.emit(ClientEvent::TurnAck {
            session_id,
            client_turn_id,
            stage,
            duplicate,
        });
    }

    // Subscriptions and catch-up

    async fn send_subscribe(&mut self, session_id: &str) {
        if self.transport.is_none() {
            return;
        }
        let deadline = Instant::now() + self.config.stream.subscribe_timeout();
        let Some(sync) = self.sessions.get_mut(session_id) else {
            return;
        };
        let Some(generation) = sync.coordinator.begin_attempt() else {
            return;
        };
        let request_id = new_id();
        sync.retry_at = None;
        sync.pending_subscribe = Some(PendingSubscribe {
            request_id: request_id.clone(),
            generation,
            deadline,
        });
        let message = ClientMessage::Subscribe {
            session_id: session_id.to_string(),
            level: sync.level,
            since_seq: Some(sync.last_seen()),
            request_id,
        };
        debug!(
            component = "client_engine",
            event = "client.subscribe.sent",
            session_id = %session_id,
            level = ?sync.level,
            since_seq = sync.last_seen(),
            generation = %generation,
            "Subscribing"
        );
        self.send(message).await;
    }

    async fn handle_subscribe_result(&mut self, result: RpcResult) {
        let now = Instant::now();
        let Some((session_id, sync)) = self.sessions.iter_mut().find(|(_, sync)| {
            sync.pending_subscribe
                .as_ref()
                .is_some_and(|pending| pending.request_id == result.request_id)
        }) else {
            debug!(
                component = "client_engine",
                event = "client.subscribe.stale_reply",
                request_id = %result.request_id,
                "Ignoring reply to an abandoned subscribe"
            );
            return;
        };
        let session_id = session_id.clone();
        let Some(pending) = sync.pending_subscribe.take() else {
            return;
        };

        if !result.success {
            warn!(
                component = "client_engine",
                event = "client.subscribe.rejected",
                session_id = %session_id,
                error = ?result.error,
                "Subscribe rejected"
            );
            if let ReconnectStep::Retry { delay, .. } = sync.coordinator.failed(pending.generation)
            {
                sync.retry_at = Some(now + delay);
            }
            return;
        }
        if !sync.coordinator.succeeded(pending.generation) {
            return;
        }

        let verdict = match result.data_as::<SubscribeData>() {
            Some(data) => sync.on_subscribed(data),
            None => {
                sync.subscribed = true;
                SubscribeVerdict::NeedsResync
            }
        };
        match verdict {
            SubscribeVerdict::CatchingUp => {}
            SubscribeVerdict::NeedsResync => self.start_resync(&session_id),
            SubscribeVerdict::ServerRestarted {
                last_seen,
                current_seq,
            } => {
                warn!(
                    component = "client_engine",
                    event = "client.server_restart_detected",
                    session_id = %session_id,
                    last_seen,
                    current_seq,
                    "Server sequence went backwards; forcing full resync"
                );
                self.store.set(&session_id, 0);
                self.start_resync(&session_id);
            }
        }
        self.resend_turns(Some(&session_id)).await;
    }

    /// Re-send every turn that has not completed. Acks sent while we were
    /// detached are lost; the server's dedupe cache answers a repeat with
    /// the turn's current stage instead of running it again. `None` covers
    /// turns for sessions this client does not track.
    async fn resend_turns(&mut self, session_id: Option<&str>) {
        let due: Vec<ClientMessage> = self
            .turns
            .values()
            .filter(|turn| match session_id {
                Some(id) => turn.session_id == id,
                None => !self.sessions.contains_key(&turn.session_id),
            })
            .map(|turn| turn.clone().into_message())
            .collect();
        for message in due {
            self.send(message).await;
        }
    }

    fn start_resync(&mut self, session_id: &str) {
        let Some(sync) = self.sessions.get_mut(session_id) else {
            return;
        };
        let epoch = sync.begin_resync();
        info!(
            component = "client_engine",
            event = "client.resync.started",
            session_id = %session_id,
            epoch,
            "Fetching session snapshot"
        );

        let http = self.http.clone();
        let config = self.config.clone();
        let tx = self.resync_tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = resync::fetch_snapshot(&http, &config, &session_id).await;
            let _ = tx.send((session_id, epoch, result));
        });
    }

    async fn handle_resync_result(
        &mut self,
        session_id: String,
        epoch: u64,
        result: Result<SessionSnapshot>,
    ) {
        let now = Instant::now();
        let Some(sync) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !sync.resync_matches(epoch) {
            debug!(
                component = "client_engine",
                event = "client.resync.stale",
                session_id = %session_id,
                epoch,
                "Discarding superseded snapshot"
            );
            return;
        }

        match result {
            Ok(snapshot) => {
                let applied = sync.finish_resync(snapshot.current_seq);
                let last_seen = sync.last_seen();
                self.store.set(&session_id, last_seen);
                info!(
                    component = "client_engine",
                    event = "client.resync.completed",
                    session_id = %session_id,
                    current_seq = snapshot.current_seq,
                    replayed = applied.deliver.len(),
                    "Session resynchronized"
                );
                self.emit(ClientEvent::Resynced(snapshot));
                for event in applied.deliver {
                    self.coalescer.receive(event, now);
                }
                if applied.gap.is_some() {
                    self.send_subscribe(&session_id).await;
                }
            }
            Err(error) => {
                sync.abandon_resync();
                if let ReconnectStep::Retry { delay, .. } = sync.coordinator.connection_lost() {
                    sync.retry_at = Some(now + delay);
                }
                warn!(
                    component = "client_engine",
                    event = "client.resync.failed",
                    session_id = %session_id,
                    error = %error,
                    "Snapshot fetch failed"
                );
                self.emit(ClientEvent::Error {
                    code: "sequence_gap".to_string(),
                    message: format!("resync failed: {error}"),
                    session_id: Some(session_id),
                });
            }
        }
    }

    async fn handle_probe_result(&mut self, result: RpcResult) {
        let Some(session_id) = self.probes.remove(&result.request_id) else {
            return;
        };
        let Some(probe) = result.data_as::<StateProbeData>() else {
            return;
        };
        let Some(sync) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if !probe.busy {
            sync.watchdog.disarm();
        }
        let behind = probe.current_seq > sync.last_seen();
        debug!(
            component = "client_engine",
            event = "client.probe.answered",
            session_id = %session_id,
            current_seq = probe.current_seq,
            last_seen = sync.last_seen(),
            busy = probe.busy,
            "State probe answered"
        );
        if behind && sync.pending_subscribe.is_none() && !sync.is_resyncing() {
            self.send_subscribe(&session_id).await;
        }
    }

    // Session timers: subscribe timeouts, session retries, watchdogs

    async fn handle_session_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, sync)| sync.next_deadline().is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in due {
            self.handle_session_deadline(&session_id, now).await;
        }
    }

    async fn handle_session_deadline(&mut self, session_id: &str, now: Instant) {
        let Some(sync) = self.sessions.get_mut(session_id) else {
            return;
        };

        if let Some(pending) = sync.pending_subscribe.as_ref().filter(|p| p.deadline <= now) {
            let generation = pending.generation;
            sync.pending_subscribe = None;
            warn!(
                component = "client_engine",
                event = "client.subscribe.timeout",
                session_id = %session_id,
                generation = %generation,
                "Subscribe reply timed out"
            );
            if let ReconnectStep::Retry { delay, .. } = sync.coordinator.failed(generation) {
                sync.retry_at = Some(now + delay);
            }
        }

        let mut resubscribe = false;
        if sync.retry_at.is_some_and(|at| at <= now) {
            sync.retry_at = None;
            resubscribe = true;
        }

        let action = if sync.watchdog.deadline().is_some_and(|at| at <= now) {
            sync.watchdog.on_deadline(now)
        } else {
            None
        };
        match action {
            Some(WatchdogAction::Probe) => {
                let request_id = new_id();
                debug!(
                    component = "client_engine",
                    event = "client.watchdog.probe",
                    session_id = %session_id,
                    "Session silent during a turn, probing"
                );
                self.probes
                    .insert(request_id.clone(), session_id.to_string());
                self.send(ClientMessage::GetState {
                    session_id: session_id.to_string(),
                    request_id,
                })
                .await;
            }
            Some(WatchdogAction::Reconnect { silent_for }) => {
                let error = StreamError::WatchdogTimeout {
                    session_id: session_id.to_string(),
                    silent_for,
                };
                warn!(
                    component = "client_engine",
                    event = "client.watchdog.reconnect",
                    session_id = %session_id,
                    error = %error,
                    "Forcing session reconnect"
                );
                if let ReconnectStep::Retry { delay, .. } = sync.coordinator.connection_lost() {
                    sync.pending_subscribe = None;
                    sync.retry_at = Some(now + delay);
                }
            }
            None => {}
        }

        if resubscribe {
            self.send_subscribe(session_id).await;
        }
    }

    // Output

    fn emit(&mut self, event: ClientEvent) {
        self.coalescer.flush();
        let _ = self.events.send(event);
    }

    fn publish_status(&mut self) {
        let state = if self.transport.is_some() {
            LinkState::Connected
        } else {
            match self.coordinator.phase() {
                ReconnectPhase::Disconnected => LinkState::Disconnected,
                ReconnectPhase::Reconnecting { .. } => LinkState::Reconnecting,
                ReconnectPhase::Idle | ReconnectPhase::Connecting | ReconnectPhase::Connected => {
                    LinkState::Connecting
                }
            }
        };
        let phase = match state {
            LinkState::Disconnected => SyncPhase::Failed,
            LinkState::Connected if !self.sessions.values().any(|s| s.is_syncing()) => {
                SyncPhase::Live
            }
            _ => SyncPhase::Syncing,
        };
        let status = ConnectionStatus {
            state,
            phase,
            attempt: self.coordinator.attempt(),
            last_activity: self.last_activity,
        };

        let previous = *self.status_tx.borrow();
        if previous == status {
            return;
        }
        self.status_tx.send_replace(status);
        if previous.state != status.state || previous.phase != status.phase {
            debug!(
                component = "client_engine",
                event = "client.status.changed",
                state = ?status.state,
                phase = ?status.phase,
                attempt = status.attempt,
                "Connection status changed"
            );
            self.emit(ClientEvent::Connection(status));
        }
    }

    fn flush_store(&mut self) {
        if let Err(error) = self.store.flush() {
            warn!(
                component = "client_engine",
                event = "client.seq_store.flush_failed",
                error = %error,
                "Failed to persist last-seen sequence numbers"
            );
        }
    }

    async fn shutdown(&mut self) {
        if let Some(connecting) = self.connecting.take() {
            connecting.abort();
        }
        self.coalescer.flush();
        self.flush_store();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        info!(
            component = "client_engine",
            event = "client.engine.stopped",
            "Client engine stopped"
        );
    }
}

async fn recv_inbound(transport: &mut Option<Transport>) -> Result<Inbound> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
