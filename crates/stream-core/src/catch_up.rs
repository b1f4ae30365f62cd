//! Catch-up resolution: replay from the ring, or signal a bulk resync.
//!
//! Pure and synchronous. The bulk fallback fetch lives with the caller.

use crate::ring::SequenceRing;

#[derive(Debug, Clone, PartialEq)]
pub enum CatchUpOutcome<T> {
    /// Every missed event, ascending. May be empty when already current.
    Replay(Vec<T>),
    /// The ring cannot bridge the gap; fetch full state out of band.
    Gap,
}

pub fn resolve<T: Clone>(ring: &SequenceRing<T>, since_seq: u64) -> CatchUpOutcome<T> {
    if ring.can_serve(since_seq) {
        CatchUpOutcome::Replay(ring.replay(since_seq))
    } else {
        CatchUpOutcome::Gap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(capacity: usize, upto: u64) -> SequenceRing<u64> {
        let mut ring: SequenceRing<u64> = SequenceRing::new(capacity, |seq: &u64| *seq);
        for seq in 1..=upto {
            ring.append(seq);
        }
        ring
    }

    #[test]
    fn replays_when_gap_is_retained() {
        let ring = ring_with(3, 4);
        assert_eq!(resolve(&ring, 2), CatchUpOutcome::Replay(vec![3, 4]));
        assert_eq!(resolve(&ring, 1), CatchUpOutcome::Replay(vec![2, 3, 4]));
    }

    #[test]
    fn ring_miss_is_a_gap() {
        let ring = ring_with(3, 4);
        assert_eq!(resolve(&ring, 0), CatchUpOutcome::Gap);
    }

    #[test]
    fn caller_ahead_of_server_is_a_gap() {
        // Server restarted and renumbered from zero.
        let ring = ring_with(500, 3);
        assert_eq!(resolve(&ring, 42), CatchUpOutcome::Gap);
    }

    #[test]
    fn already_current_is_complete_and_empty() {
        let ring = ring_with(3, 4);
        assert_eq!(resolve(&ring, 4), CatchUpOutcome::Replay(Vec::new()));
    }
}
