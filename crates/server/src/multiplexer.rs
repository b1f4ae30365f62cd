//! Session multiplexer
//!
//! Two lifetimes live here. Session logs (sequence counter, replay ring,
//! reduced state) and the owner-wide ring belong to the owner and survive
//! connection churn. Subscriptions belong to the attached connection and are
//! dropped by `detach_connection`.
//!
//! A log is created by the first publish or turn for its session and
//! released by an explicit unsubscribe. Past `max_session_logs`, the least
//! recently touched idle log is evicted to make room.
//!
//! Single-writer: only the owner actor holds a `SessionMultiplexer`.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tether_protocol::{
    AgentEvent, ClientMessage, ResumeStreamData, SequencedEvent, SessionSnapshot,
    StateProbeData, SubscriptionLevel, TurnCommand, TurnStage,
};
use tether_stream_core::catch_up::{self, CatchUpOutcome};
use tether_stream_core::{
    PayloadFingerprint, SequenceRing, StreamConfig, StreamError, SubmitOutcome, TurnDedupeCache,
};
use tracing::debug;

use crate::snapshot::SnapshotReducer;

struct SessionLog {
    ring: SequenceRing<SequencedEvent>,
    state: Value,
    busy: bool,
    /// Multiplexer tick of the last subscribe, publish or turn.
    touched: u64,
}

impl SessionLog {
    fn new(capacity: usize, state: Value) -> Self {
        Self {
            ring: SequenceRing::for_session(capacity),
            state,
            busy: false,
            touched: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub current_seq: u64,
    pub catch_up_complete: bool,
    /// Missed events to send after the reply, already filtered by level.
    pub replay: Vec<SequencedEvent>,
    /// Session that lost `full` to this subscribe.
    pub downgraded: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub event: SequencedEvent,
    /// Whether the attached connection should receive the event.
    pub deliver: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub level: Option<SubscriptionLevel>,
    pub current_seq: u64,
    pub retained: usize,
    pub busy: bool,
}

pub struct SessionMultiplexer {
    sessions: HashMap<String, SessionLog>,
    owner_ring: SequenceRing<SequencedEvent>,
    subscriptions: HashMap<String, SubscriptionLevel>,
    turns: TurnDedupeCache,
    reducer: Box<dyn SnapshotReducer>,
    session_ring_capacity: usize,
    max_session_logs: usize,
    tick: u64,
}

impl SessionMultiplexer {
    pub fn new(config: &StreamConfig, reducer: Box<dyn SnapshotReducer>) -> Self {
        Self {
            sessions: HashMap::new(),
            owner_ring: SequenceRing::for_owner(config.owner_ring_capacity),
            subscriptions: HashMap::new(),
            turns: TurnDedupeCache::new(config.turn_cache_capacity, config.turn_ttl()),
            reducer,
            session_ring_capacity: config.session_ring_capacity,
            max_session_logs: config.max_session_logs.max(1),
            tick: 0,
        }
    }

    /// Subscribe the attached connection to a session.
    ///
    /// Granting `full` downgrades the previous holder to `notifications`
    /// in the same call, so two `full` sessions are never observable.
    pub fn subscribe(
        &mut self,
        session_id: &str,
        level: SubscriptionLevel,
        since_seq: Option<u64>,
    ) -> SubscribeOutcome {
        let mut downgraded = None;
        if level == SubscriptionLevel::Full {
            for (id, held) in self.subscriptions.iter_mut() {
                if *held == SubscriptionLevel::Full && id != session_id {
                    *held = SubscriptionLevel::Notifications;
                    downgraded = Some(id.clone());
                }
            }
        }
        if let Some(previous) = &downgraded {
            debug!(
                component = "multiplexer",
                event = "multiplexer.full.downgraded",
                session_id = %previous,
                new_holder = %session_id,
                "Downgraded previous full subscriber to notifications"
            );
        }
        self.subscriptions.insert(session_id.to_string(), level);

        self.tick += 1;
        let (current_seq, catch_up_complete, replay) = match self.sessions.get_mut(session_id) {
            // Nothing published yet: only a client with no position is caught up.
            None => (0, since_seq.unwrap_or(0) == 0, Vec::new()),
            Some(log) => {
                log.touched = self.tick;
                let current_seq = log.ring.current_seq();
                let (complete, replay) = match since_seq {
                    // No position: nothing to replay, complete only if there is no history.
                    None => (current_seq == 0, Vec::new()),
                    Some(since) => match catch_up::resolve(&log.ring, since) {
                        CatchUpOutcome::Replay(events) => (
                            true,
                            events
                                .into_iter()
                                .filter(|event| level.admits(&event.name))
                                .collect(),
                        ),
                        CatchUpOutcome::Gap => (false, Vec::new()),
                    },
                };
                (current_seq, complete, replay)
            }
        };

        SubscribeOutcome {
            current_seq,
            catch_up_complete,
            replay,
            downgraded,
        }
    }

    /// Drop the subscription and the session's log with it.
    pub fn unsubscribe(&mut self, session_id: &str) -> Result<(), StreamError> {
        if self.subscriptions.remove(session_id).is_none() {
            return Err(StreamError::UnknownSession(session_id.to_string()));
        }
        if let Some(log) = self.sessions.remove(session_id) {
            debug!(
                component = "multiplexer",
                event = "multiplexer.session.released",
                session_id = %session_id,
                current_seq = log.ring.current_seq(),
                "Released session log"
            );
        }
        Ok(())
    }

    /// Sequence (if durable), record and decide delivery of one agent event.
    pub fn publish(&mut self, session_id: &str, event: AgentEvent) -> Published {
        let deliver = self
            .subscriptions
            .get(session_id)
            .is_some_and(|level| level.admits(&event.name));

        if !event.is_durable() {
            return Published {
                event: SequencedEvent::unsequenced(session_id, event),
                deliver,
            };
        }

        let stream_seq = self.owner_ring.current_seq() + 1;
        self.make_room(session_id);
        let reducer = &self.reducer;
        let log = session_log(
            &mut self.sessions,
            session_id,
            self.session_ring_capacity,
            self.tick,
            || reducer.initial(),
        );

        let seq = log.ring.current_seq() + 1;
        let sequenced = SequencedEvent::sequenced(session_id, seq, stream_seq, event);
        log.ring.append(sequenced.clone());
        reducer.apply(&mut log.state, &sequenced);
        match sequenced.name.as_str() {
            "agent_start" => log.busy = true,
            "agent_end" | "session_ended" | "stop_confirmed" => log.busy = false,
            _ => {}
        }
        self.owner_ring.append(sequenced.clone());

        Published {
            event: sequenced,
            deliver,
        }
    }

    /// Resolve the session an inbound command targets. Commands for sessions
    /// the connection has not subscribed to fail fast.
    pub fn route(&self, command: &ClientMessage) -> Result<String, StreamError> {
        let session_id = command.session_id().unwrap_or_default();
        if self.subscriptions.contains_key(session_id) {
            Ok(session_id.to_string())
        } else {
            Err(StreamError::UnknownSession(session_id.to_string()))
        }
    }

    pub fn submit_turn(&mut self, turn: &TurnCommand) -> SubmitOutcome {
        let fingerprint = PayloadFingerprint::of_turn(turn.kind, &turn.message);
        let outcome = self.turns.submit(&turn.client_turn_id, fingerprint);
        if outcome == SubmitOutcome::Accept {
            self.make_room(&turn.session_id);
            let reducer = &self.reducer;
            session_log(
                &mut self.sessions,
                &turn.session_id,
                self.session_ring_capacity,
                self.tick,
                || reducer.initial(),
            )
            .busy = true;
        }
        outcome
    }

    pub fn advance_turn(&mut self, client_turn_id: &str, stage: TurnStage) -> Option<TurnStage> {
        self.turns.advance(client_turn_id, stage)
    }

    pub fn state_probe(&self, session_id: &str) -> StateProbeData {
        let (current_seq, busy) = self
            .sessions
            .get(session_id)
            .map(|log| (log.ring.current_seq(), log.busy))
            .unwrap_or((0, false));
        StateProbeData {
            session_id: session_id.to_string(),
            current_seq,
            level: self.level(session_id),
            busy,
        }
    }

    /// Owner-wide catch-up of notification events for sessions watched at
    /// `notifications` level.
    pub fn resume_stream(&self, since_stream_seq: u64) -> (ResumeStreamData, Vec<SequencedEvent>) {
        let current_stream_seq = self.owner_ring.current_seq();
        match catch_up::resolve(&self.owner_ring, since_stream_seq) {
            CatchUpOutcome::Replay(events) => {
                let events = events
                    .into_iter()
                    .filter(|event| {
                        event.is_notification()
                            && self.subscriptions.get(&event.session_id)
                                == Some(&SubscriptionLevel::Notifications)
                    })
                    .collect();
                (
                    ResumeStreamData {
                        current_stream_seq,
                        catch_up_complete: true,
                    },
                    events,
                )
            }
            CatchUpOutcome::Gap => (
                ResumeStreamData {
                    current_stream_seq,
                    catch_up_complete: false,
                },
                Vec::new(),
            ),
        }
    }

    /// A subscribed session with nothing published yet snapshots as empty.
    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, StreamError> {
        let (current_seq, state) = match self.sessions.get(session_id) {
            Some(log) => (log.ring.current_seq(), log.state.clone()),
            None if self.subscriptions.contains_key(session_id) => (0, self.reducer.initial()),
            None => return Err(StreamError::UnknownSession(session_id.to_string())),
        };
        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            current_seq,
            state,
        })
    }

    /// Forget the attached connection's subscriptions; session logs stay.
    pub fn detach_connection(&mut self) {
        self.subscriptions.clear();
    }

    pub fn level(&self, session_id: &str) -> Option<SubscriptionLevel> {
        self.subscriptions.get(session_id).copied()
    }

    pub fn stream_seq(&self) -> u64 {
        self.owner_ring.current_seq()
    }

    pub fn turn_cache_len(&self) -> usize {
        self.turns.len()
    }

    pub fn sessions_status(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self
            .sessions
            .iter()
            .map(|(id, log)| SessionStatus {
                session_id: id.clone(),
                level: self.level(id),
                current_seq: log.ring.current_seq(),
                retained: log.ring.len(),
                busy: log.busy,
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Advance the tick and, if `session_id` would be a new log past the
    /// limit, evict the least recently touched idle log.
    fn make_room(&mut self, session_id: &str) {
        self.tick += 1;
        if self.sessions.contains_key(session_id) || self.sessions.len() < self.max_session_logs {
            return;
        }
        let idle = self
            .sessions
            .iter()
            .filter(|(id, log)| !log.busy && !self.subscriptions.contains_key(*id))
            .min_by_key(|(_, log)| log.touched)
            .map(|(id, _)| id.clone());
        if let Some(id) = idle {
            self.sessions.remove(&id);
            debug!(
                component = "multiplexer",
                event = "multiplexer.session.evicted",
                session_id = %id,
                "Evicted idle session log"
            );
        }
    }
}

fn session_log<'a>(
    sessions: &'a mut HashMap<String, SessionLog>,
    session_id: &str,
    capacity: usize,
    tick: u64,
    initial: impl FnOnce() -> Value,
) -> &'a mut SessionLog {
    let log = sessions
        .entry(session_id.to_string())
        .or_insert_with(|| SessionLog::new(capacity, initial()));
    log.touched = tick;
    log
}
