//! Per-session synchronization state on the client.
//!
//! Holds the ordering tracker, the session-level reconnect coordinator, the
//! pending subscribe and the resync buffer for one session. Decisions live
//! here; the engine performs the I/O they call for.

use tether_protocol::{SequencedEvent, SubscribeData, SubscriptionLevel};
use tether_stream_core::{
    Generation, Observation, ReconnectCoordinator, SequenceTracker, StreamConfig,
};
use tokio::time::Instant;

use crate::watchdog::SilenceWatchdog;

#[derive(Debug, Clone)]
pub struct PendingSubscribe {
    pub request_id: String,
    pub generation: Generation,
    pub deadline: Instant,
}

#[derive(Debug)]
struct Resync {
    epoch: u64,
    buffer: Vec<SequencedEvent>,
}

/// What to do with an inbound durable event.
#[derive(Debug, PartialEq)]
pub enum DurableOutcome {
    Deliver(SequencedEvent),
    /// Held until the in-flight resync lands.
    Buffered,
    Duplicate,
    Gap { expected: u64, received: u64 },
}

/// How a successful subscribe reply leaves the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeVerdict {
    /// Replay (if any) follows on the socket.
    CatchingUp,
    /// The ring could not serve `since_seq`; fetch a snapshot.
    NeedsResync,
    /// Server numbering went backwards: it restarted.
    ServerRestarted { last_seen: u64, current_seq: u64 },
}

/// Result of applying a snapshot.
#[derive(Debug, Default, PartialEq)]
pub struct ResyncApplied {
    /// Buffered events newer than the snapshot, in order.
    pub deliver: Vec<SequencedEvent>,
    pub gap: Option<(u64, u64)>,
}

#[derive(Debug)]
pub struct SessionSync {
    pub session_id: String,
    pub level: SubscriptionLevel,
    pub coordinator: ReconnectCoordinator,
    pub pending_subscribe: Option<PendingSubscribe>,
    pub subscribed: bool,
    pub watchdog: SilenceWatchdog,
    /// Session-level retry scheduled by the coordinator.
    pub retry_at: Option<Instant>,
    tracker: SequenceTracker,
    resync: Option<Resync>,
    next_epoch: u64,
}

impl SessionSync {
    pub fn new(
        session_id: impl Into<String>,
        level: SubscriptionLevel,
        last_seen: u64,
        config: &StreamConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            level,
            coordinator: ReconnectCoordinator::new(config.session_backoff),
            pending_subscribe: None,
            subscribed: false,
            watchdog: SilenceWatchdog::new(
                config.silence_probe_after(),
                config.silence_reconnect_after(),
            ),
            retry_at: None,
            tracker: SequenceTracker::new(last_seen),
            resync: None,
            next_epoch: 0,
        }
    }

    pub fn last_seen(&self) -> u64 {
        self.tracker.last_seen()
    }

    pub fn is_full(&self) -> bool {
        self.level == SubscriptionLevel::Full
    }

    /// Still catching up: waiting on a subscribe reply, a snapshot, or a retry.
    pub fn is_syncing(&self) -> bool {
        self.pending_subscribe.is_some() || self.resync.is_some() || self.retry_at.is_some()
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync.is_some()
    }

    /// Earliest timer this session is waiting on.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending_subscribe.as_ref().map(|p| p.deadline),
            self.retry_at,
            self.watchdog.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn downgrade(&mut self) {
        self.level = SubscriptionLevel::Notifications;
        self.watchdog.disarm();
    }

    pub fn on_durable(&mut self, event: SequencedEvent, seq: u64) -> DurableOutcome {
        if let Some(resync) = self.resync.as_mut() {
            resync.buffer.push(event);
            return DurableOutcome::Buffered;
        }
        let observation = match self.level {
            SubscriptionLevel::Full => self.tracker.observe(seq),
            SubscriptionLevel::Notifications => self.tracker.observe_sparse(seq),
        };
        match observation {
            Observation::InOrder => DurableOutcome::Deliver(event),
            Observation::Duplicate => DurableOutcome::Duplicate,
            Observation::Gap { expected, received } => DurableOutcome::Gap { expected, received },
        }
    }

    pub fn on_subscribed(&mut self, data: SubscribeData) -> SubscribeVerdict {
        self.subscribed = true;
        self.retry_at = None;
        let last_seen = self.tracker.last_seen();
        if data.current_seq < last_seen {
            self.tracker.reset_to(0);
            return SubscribeVerdict::ServerRestarted {
                last_seen,
                current_seq: data.current_seq,
            };
        }
        if data.catch_up_complete {
            SubscribeVerdict::CatchingUp
        } else {
            SubscribeVerdict::NeedsResync
        }
    }

    /// Start buffering durable events; returns the epoch to tag the fetch with.
    pub fn begin_resync(&mut self) -> u64 {
        self.next_epoch += 1;
        self.resync = Some(Resync {
            epoch: self.next_epoch,
            buffer: Vec::new(),
        });
        self.next_epoch
    }

    pub fn resync_matches(&self, epoch: u64) -> bool {
        self.resync.as_ref().is_some_and(|r| r.epoch == epoch)
    }

    /// Snapshot landed at `current_seq`. Drops buffered events it already covers.
    pub fn finish_resync(&mut self, current_seq: u64) -> ResyncApplied {
        self.tracker.reset_to(current_seq);
        let buffered = self.resync.take().map(|r| r.buffer).unwrap_or_default();
        let mut applied = ResyncApplied::default();
        for event in buffered {
            let Some(seq) = event.seq else { continue };
            match self.on_durable(event, seq) {
                DurableOutcome::Deliver(event) => applied.deliver.push(event),
                DurableOutcome::Gap { expected, received } => {
                    applied.gap = Some((expected, received));
                    break;
                }
                DurableOutcome::Duplicate | DurableOutcome::Buffered => {}
            }
        }
        applied
    }

    /// Drop the resync without applying anything.
    pub fn abandon_resync(&mut self) {
        self.resync = None;
    }

    /// The connection carrying this session went away.
    pub fn teardown(&mut self) {
        self.pending_subscribe = None;
        self.subscribed = false;
        self.retry_at = None;
        self.resync = None;
        self.watchdog.disarm();
        self.coordinator.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_protocol::AgentEvent;

    fn event(seq: u64) -> SequencedEvent {
        SequencedEvent::sequenced("s1", seq, seq, AgentEvent::durable("message_end", json!({})))
    }

    fn session(level: SubscriptionLevel, last_seen: u64) -> SessionSync {
        SessionSync::new("s1", level, last_seen, &StreamConfig::default())
    }

    #[test]
    fn full_level_reports_gaps_and_duplicates() {
        let mut sync = session(SubscriptionLevel::Full, 2);
        assert_eq!(sync.on_durable(event(2), 2), DurableOutcome::Duplicate);
        assert_eq!(sync.on_durable(event(3), 3), DurableOutcome::Deliver(event(3)));
        assert_eq!(
            sync.on_durable(event(5), 5),
            DurableOutcome::Gap {
                expected: 4,
                received: 5
            }
        );
        assert_eq!(sync.last_seen(), 3);
    }

    #[test]
    fn notification_level_tolerates_skips() {
        let mut sync = session(SubscriptionLevel::Notifications, 2);
        assert_eq!(sync.on_durable(event(7), 7), DurableOutcome::Deliver(event(7)));
        assert_eq!(sync.last_seen(), 7);
    }

    #[test]
    fn lower_current_seq_means_restart() {
        let mut sync = session(SubscriptionLevel::Full, 42);
        let verdict = sync.on_subscribed(SubscribeData {
            current_seq: 0,
            catch_up_complete: false,
        });
        assert_eq!(
            verdict,
            SubscribeVerdict::ServerRestarted {
                last_seen: 42,
                current_seq: 0
            }
        );
        assert_eq!(sync.last_seen(), 0);
        assert!(sync.subscribed);
    }

    #[test]
    fn incomplete_catch_up_needs_resync() {
        let mut sync = session(SubscriptionLevel::Full, 3);
        assert_eq!(
            sync.on_subscribed(SubscribeData {
                current_seq: 900,
                catch_up_complete: false,
            }),
            SubscribeVerdict::NeedsResync
        );
        assert_eq!(
            sync.on_subscribed(SubscribeData {
                current_seq: 5,
                catch_up_complete: true,
            }),
            SubscribeVerdict::CatchingUp
        );
    }

    #[test]
    fn resync_buffers_then_drops_covered_events() {
        let mut sync = session(SubscriptionLevel::Full, 0);
        let epoch = sync.begin_resync();
        assert!(sync.is_syncing());
        for seq in [9, 10, 11, 12] {
            assert_eq!(sync.on_durable(event(seq), seq), DurableOutcome::Buffered);
        }
        assert!(sync.resync_matches(epoch));
        assert!(!sync.resync_matches(epoch + 1));

        let applied = sync.finish_resync(10);
        assert_eq!(applied.deliver, vec![event(11), event(12)]);
        assert_eq!(applied.gap, None);
        assert_eq!(sync.last_seen(), 12);
        assert!(!sync.is_resyncing());
    }

    #[test]
    fn resync_reports_gap_in_buffer() {
        let mut sync = session(SubscriptionLevel::Full, 0);
        sync.begin_resync();
        sync.on_durable(event(6), 6);
        sync.on_durable(event(8), 8);
        let applied = sync.finish_resync(5);
        assert_eq!(applied.deliver, vec![event(6)]);
        assert_eq!(applied.gap, Some((7, 8)));
    }

    #[test]
    fn newer_resync_supersedes_older() {
        let mut sync = session(SubscriptionLevel::Full, 0);
        let first = sync.begin_resync();
        let second = sync.begin_resync();
        assert!(!sync.resync_matches(first));
        assert!(sync.resync_matches(second));
        sync.teardown();
        assert!(!sync.resync_matches(second));
    }
}
