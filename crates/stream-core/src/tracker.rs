//! Receiver-side ordering check for one session's durable events.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Exactly `last_seen + 1`; the tracker has advanced.
    InOrder,
    /// At or below `last_seen`; discard without side effects.
    Duplicate,
    /// Ahead of `last_seen + 1`; events were lost in between.
    Gap { expected: u64, received: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last_seen: u64,
}

impl SequenceTracker {
    pub fn new(last_seen: u64) -> Self {
        Self { last_seen }
    }

    pub fn observe(&mut self, seq: u64) -> Observation {
        let expected = self.last_seen + 1;
        if seq <= self.last_seen {
            Observation::Duplicate
        } else if seq == expected {
            self.last_seen = seq;
            Observation::InOrder
        } else {
            Observation::Gap {
                expected,
                received: seq,
            }
        }
    }

    /// Like `observe`, for streams filtered server-side (notification level)
    /// where skipped numbers are expected. Only duplicates are rejected.
    pub fn observe_sparse(&mut self, seq: u64) -> Observation {
        if seq <= self.last_seen {
            return Observation::Duplicate;
        }
        self.last_seen = seq;
        Observation::InOrder
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Jump to a known position (after a snapshot or a detected restart).
    pub fn reset_to(&mut self, seq: u64) {
        self.last_seen = seq;
    }
}
