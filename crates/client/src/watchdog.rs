//! Silence watchdog for a session with an active turn.
//!
//! ```text
//! Disarmed ──arm──▶ Waiting ──15s silent──▶ Probed ──30s silent──▶ (reconnect)
//!                      ▲                      │
//!                      └────── activity ──────┘
//! ```
//!
//! Sending the probe does not restart the clock; only real activity does.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Send a lightweight state probe.
    Probe,
    /// Still silent after the probe: force a session-level reconnect.
    Reconnect { silent_for: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Disarmed,
    Waiting { since: Instant },
    Probed { since: Instant, probed_at: Instant },
}

#[derive(Debug, Clone)]
pub struct SilenceWatchdog {
    probe_after: Duration,
    reconnect_after: Duration,
    stage: Stage,
}

impl SilenceWatchdog {
    pub fn new(probe_after: Duration, reconnect_after: Duration) -> Self {
        Self {
            probe_after,
            reconnect_after,
            stage: Stage::Disarmed,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.stage != Stage::Disarmed
    }

    /// Start watching, or restart the clock if already watching.
    pub fn arm(&mut self, now: Instant) {
        self.stage = Stage::Waiting { since: now };
    }

    pub fn disarm(&mut self) {
        self.stage = Stage::Disarmed;
    }

    /// Any event for the session. No effect while disarmed.
    pub fn on_activity(&mut self, now: Instant) {
        if self.is_armed() {
            self.stage = Stage::Waiting { since: now };
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.stage {
            Stage::Disarmed => None,
            Stage::Waiting { since } => Some(since + self.probe_after),
            Stage::Probed { probed_at, .. } => Some(probed_at + self.reconnect_after),
        }
    }

    /// Called when `deadline` has passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<WatchdogAction> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        match self.stage {
            Stage::Disarmed => None,
            Stage::Waiting { since } => {
                self.stage = Stage::Probed {
                    since,
                    probed_at: now,
                };
                Some(WatchdogAction::Probe)
            }
            Stage::Probed { since, .. } => {
                // Re-armed from now so a reconnect that does not restore
                // activity is retried on the same schedule.
                self.stage = Stage::Waiting { since: now };
                Some(WatchdogAction::Reconnect {
                    silent_for: now.duration_since(since),
                })
            }
        }
    }
}
