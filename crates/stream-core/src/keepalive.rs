//! Ping/pong bookkeeping
//!
//! Each side keeps one tracker per connection and calls `on_tick` on its
//! ping interval. A tick that finds the previous ping still unanswered
//! counts as a miss; `max_missed` consecutive misses declare the peer dead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingAction {
    SendPing,
    PeerDead { missed: u32 },
}

#[derive(Debug, Clone)]
pub struct PingTracker {
    max_missed: u32,
    awaiting_pong: bool,
    missed: u32,
}

impl PingTracker {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            awaiting_pong: false,
            missed: 0,
        }
    }

    pub fn on_tick(&mut self) -> PingAction {
        if self.awaiting_pong {
            self.missed += 1;
            if self.missed >= self.max_missed {
                return PingAction::PeerDead {
                    missed: self.missed,
                };
            }
        }
        self.awaiting_pong = true;
        PingAction::SendPing
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }

    pub fn reset(&mut self) {
        self.on_pong();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_dies_after_two_missed_cycles() {
        let mut tracker = PingTracker::new(2);
        assert_eq!(tracker.on_tick(), PingAction::SendPing);
        // First cycle unanswered: one miss, ping again.
        assert_eq!(tracker.on_tick(), PingAction::SendPing);
        assert_eq!(tracker.on_tick(), PingAction::PeerDead { missed: 2 });
    }

    #[test]
    fn server_dies_after_one_missed_cycle() {
        let mut tracker = PingTracker::new(1);
        assert_eq!(tracker.on_tick(), PingAction::SendPing);
        assert_eq!(tracker.on_tick(), PingAction::PeerDead { missed: 1 });
    }

    #[test]
    fn pong_clears_misses() {
        let mut tracker = PingTracker::new(2);
        tracker.on_tick();
        tracker.on_tick();
        tracker.on_pong();
        // Counting starts over: two more unanswered cycles before dead.
        assert_eq!(tracker.on_tick(), PingAction::SendPing);
        assert_eq!(tracker.on_tick(), PingAction::SendPing);
        assert_eq!(tracker.on_tick(), PingAction::PeerDead { missed: 2 });
    }

    #[test]
    fn answered_pings_never_miss() {
        let mut tracker = PingTracker::new(1);
        for _ in 0..100 {
            assert_eq!(tracker.on_tick(), PingAction::SendPing);
            tracker.on_pong();
        }
    }
}
