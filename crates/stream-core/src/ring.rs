//! Bounded, append-only replay buffer of sequenced events.
//!
//! One ring per session (keyed by `seq`) and one per owner (keyed by
//! `stream_seq`). Eviction is strict FIFO and the capacity never grows.
//! Contents are process-local: a restart starts every ring empty at 0.

use std::collections::VecDeque;

use tether_protocol::SequencedEvent;
use tracing::warn;

pub struct SequenceRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
    current_seq: u64,
    key: fn(&T) -> u64,
}

impl SequenceRing<SequencedEvent> {
    /// Ring keyed by the per-session `seq`.
    pub fn for_session(capacity: usize) -> Self {
        Self::new(capacity, |event| event.seq.unwrap_or_default())
    }

    /// Ring keyed by the owner-wide `stream_seq`.
    pub fn for_owner(capacity: usize) -> Self {
        Self::new(capacity, |event| event.stream_seq.unwrap_or_default())
    }
}

impl<T: Clone> SequenceRing<T> {
    pub fn new(capacity: usize, key: fn(&T) -> u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            current_seq: 0,
            key,
        }
    }

    /// Append the next event, evicting the oldest when full.
    ///
    /// Returns false (and stores nothing) if the event does not advance the
    /// sequence; producers assign strictly increasing numbers.
    pub fn append(&mut self, item: T) -> bool {
        let seq = (self.key)(&item);
        if seq <= self.current_seq {
            warn!(
                component = "sequence_ring",
                event = "ring.append.out_of_order",
                seq,
                current_seq = self.current_seq,
                "Rejected non-increasing sequence number"
            );
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
        self.current_seq = seq;
        true
    }

    /// True iff every event after `since_seq` is still retained.
    pub fn can_serve(&self, since_seq: u64) -> bool {
        since_seq <= self.current_seq && since_seq.saturating_add(1) >= self.oldest_retained()
    }

    /// All retained events with sequence greater than `since_seq`, ascending.
    pub fn replay(&self, since_seq: u64) -> Vec<T> {
        let start = self.entries.partition_point(|item| (self.key)(item) <= since_seq);
        self.entries.range(start..).cloned().collect()
    }

    /// Oldest retained sequence, or `current_seq + 1` when empty.
    pub fn oldest_retained(&self) -> u64 {
        self.entries
            .front()
            .map(|item| (self.key)(item))
            .unwrap_or(self.current_seq + 1)
    }

    /// Highest sequence ever appended (0 before the first append).
    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tether_protocol::AgentEvent;

    fn event(seq: u64) -> SequencedEvent {
        SequencedEvent::sequenced(
            "s1",
            seq,
            seq + 100,
            AgentEvent::durable("message_end", Value::Null),
        )
    }

    fn seqs(events: &[SequencedEvent]) -> Vec<u64> {
        events.iter().filter_map(|e| e.seq).collect()
    }

    #[test]
    fn capacity_three_after_four_appends() {
        let mut ring = SequenceRing::for_session(3);
        for seq in 1..=4 {
            assert!(ring.append(event(seq)));
        }
        assert!(!ring.can_serve(0));
        assert!(ring.can_serve(1));
        assert!(ring.can_serve(2));
        assert_eq!(seqs(&ring.replay(2)), vec![3, 4]);
        assert_eq!(ring.oldest_retained(), 2);
    }

    #[test]
    fn empty_ring_serves_only_current() {
        let ring = SequenceRing::for_session(10);
        assert!(ring.can_serve(0));
        assert!(ring.replay(0).is_empty());
        assert!(!ring.can_serve(1));
    }

    #[test]
    fn consumer_ahead_of_ring_is_not_servable() {
        let mut ring = SequenceRing::for_session(10);
        ring.append(event(1));
        ring.append(event(2));
        assert!(!ring.can_serve(3));
        assert!(ring.can_serve(2));
        assert!(ring.replay(2).is_empty());
    }

    #[test]
    fn replay_never_exceeds_capacity_and_stays_ordered() {
        let mut ring = SequenceRing::for_session(5);
        for seq in 1..=50 {
            ring.append(event(seq));
            let retained = ring.replay(0);
            assert!(retained.len() <= 5);
            let got = seqs(&retained);
            let mut sorted = got.clone();
            sorted.sort_unstable();
            assert_eq!(got, sorted);
            for since in 0..=seq {
                let expected: Vec<u64> = (since + 1..=seq).filter(|s| *s + 5 > seq).collect();
                assert_eq!(seqs(&ring.replay(since)), expected, "since={since} at seq={seq}");
            }
        }
    }

    #[test]
    fn can_serve_boundary_holds_right_after_eviction() {
        let mut ring = SequenceRing::for_session(2);
        ring.append(event(1));
        ring.append(event(2));
        assert!(ring.can_serve(0));
        ring.append(event(3));
        assert!(!ring.can_serve(0));
        assert!(ring.can_serve(1));
    }

    #[test]
    fn replay_is_read_only() {
        let mut ring = SequenceRing::for_session(4);
        for seq in 1..=3 {
            ring.append(event(seq));
        }
        let _ = ring.replay(0);
        let _ = ring.replay(1);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.current_seq(), 3);
    }

    #[test]
    fn rejects_non_increasing_sequence() {
        let mut ring = SequenceRing::for_session(4);
        assert!(ring.append(event(1)));
        assert!(!ring.append(event(1)));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn owner_ring_keys_on_stream_seq() {
        let mut ring = SequenceRing::for_owner(2);
        ring.append(event(1));
        ring.append(event(2));
        ring.append(event(3));
        assert_eq!(ring.current_seq(), 103);
        assert!(ring.can_serve(101));
        assert!(!ring.can_serve(100));
        assert_eq!(seqs(&ring.replay(102)), vec![3]);
    }
}
