//! Reconnect state machine
//!
//! One coordinator drives the physical connection, another (one per session)
//! drives resubscription. Both share this type and differ only in policy.
//!
//! ```text
//! Idle ──begin──▶ Connecting ──succeeded──▶ Connected
//!                     │                        │
//!                   failed               connection_lost
//!                     ▼                        ▼
//!              Reconnecting(n) ◀──failed── Reconnecting(n)
//!                     │
//!              attempts exhausted
//!                     ▼
//!               Disconnected ──reset──▶ Idle
//! ```
//!
//! Every `begin_attempt` bumps the generation. Completions carry the
//! generation they were started under and are discarded when stale.

use std::time::Duration;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Terminal until `reset`.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Wait `delay`, then call `begin_attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Attempt cap reached; now `Disconnected`.
    Exhausted,
    /// The completion belonged to an older generation and was ignored.
    Stale,
}

#[derive(Debug, Clone)]
pub struct ReconnectCoordinator {
    policy: BackoffPolicy,
    phase: ReconnectPhase,
    generation: Generation,
    attempt: u32,
}

impl ReconnectCoordinator {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            generation: Generation::default(),
            attempt: 0,
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation
    }

    /// Start a new connect attempt. Returns `None` while `Disconnected`.
    pub fn begin_attempt(&mut self) -> Option<Generation> {
        if self.phase == ReconnectPhase::Disconnected {
            return None;
        }
        self.generation = Generation(self.generation.0 + 1);
        if self.attempt == 0 {
            self.phase = ReconnectPhase::Connecting;
        } else {
            self.phase = ReconnectPhase::Reconnecting {
                attempt: self.attempt,
            };
        }
        Some(self.generation)
    }

    /// Record success for `generation`. Returns false (and changes nothing)
    /// when a newer attempt has started since.
    pub fn succeeded(&mut self, generation: Generation) -> bool {
        if !self.is_current(generation) || self.phase == ReconnectPhase::Disconnected {
            return false;
        }
        self.attempt = 0;
        self.phase = ReconnectPhase::Connected;
        true
    }

    /// Record failure of the attempt started under `generation`.
    pub fn failed(&mut self, generation: Generation) -> ReconnectStep {
        if !self.is_current(generation) || self.phase == ReconnectPhase::Disconnected {
            return ReconnectStep::Stale;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.schedule()
    }

    /// An established connection dropped.
    pub fn connection_lost(&mut self) -> ReconnectStep {
        if self.phase == ReconnectPhase::Disconnected {
            return ReconnectStep::Exhausted;
        }
        // Invalidate anything still running under the dead connection.
        self.generation = Generation(self.generation.0 + 1);
        self.attempt = 1;
        self.schedule()
    }

    /// Explicit external trigger; the only way out of `Disconnected`.
    pub fn reset(&mut self) {
        self.generation = Generation(self.generation.0 + 1);
        self.attempt = 0;
        self.phase = ReconnectPhase::Idle;
    }

    fn schedule(&mut self) -> ReconnectStep {
        if self.policy.exhausted(self.attempt) {
            self.phase = ReconnectPhase::Disconnected;
            return ReconnectStep::Exhausted;
        }
        self.phase = ReconnectPhase::Reconnecting {
            attempt: self.attempt,
        };
        ReconnectStep::Retry {
            attempt: self.attempt,
            delay: self.policy.delay(self.attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(policy: BackoffPolicy) -> ReconnectCoordinator {
        ReconnectCoordinator::new(policy.with_jitter(0.0))
    }

    fn delay_of(step: ReconnectStep) -> Duration {
        match step {
            ReconnectStep::Retry { delay, .. } => delay,
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn connects_from_idle() {
        let mut coordinator = exact(BackoffPolicy::transport());
        let generation = coordinator.begin_attempt().unwrap();
        assert_eq!(coordinator.phase(), ReconnectPhase::Connecting);
        assert!(coordinator.succeeded(generation));
        assert_eq!(coordinator.phase(), ReconnectPhase::Connected);
    }

    #[test]
    fn lost_connection_restarts_at_attempt_one() {
        let mut coordinator = exact(BackoffPolicy::transport());
        let generation = coordinator.begin_attempt().unwrap();
        coordinator.succeeded(generation);

        let step = coordinator.connection_lost();
        assert_eq!(
            step,
            ReconnectStep::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            coordinator.phase(),
            ReconnectPhase::Reconnecting { attempt: 1 }
        );
    }

    #[test]
    fn jittered_first_retry_is_about_one_second() {
        let mut coordinator = ReconnectCoordinator::new(BackoffPolicy::transport());
        let generation = coordinator.begin_attempt().unwrap();
        coordinator.succeeded(generation);
        let delay = delay_of(coordinator.connection_lost());
        assert!(delay >= Duration::from_millis(750) && delay <= Duration::from_millis(1_250));
    }

    #[test]
    fn delays_grow_then_reset_on_success() {
        let mut coordinator = exact(BackoffPolicy::transport());
        let mut previous = Duration::ZERO;
        for _ in 0..6 {
            let generation = coordinator.begin_attempt().unwrap();
            let delay = delay_of(coordinator.failed(generation));
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(30));

        let generation = coordinator.begin_attempt().unwrap();
        assert!(coordinator.succeeded(generation));
        assert_eq!(coordinator.attempt(), 0);
        assert_eq!(
            delay_of(coordinator.connection_lost()),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn transport_gives_up_after_ten_attempts() {
        let mut coordinator = exact(BackoffPolicy::transport());
        for attempt in 1..=10 {
            let generation = coordinator.begin_attempt().unwrap();
            assert!(matches!(
                coordinator.failed(generation),
                ReconnectStep::Retry { attempt: a, .. } if a == attempt
            ));
        }
        let generation = coordinator.begin_attempt().unwrap();
        assert_eq!(coordinator.failed(generation), ReconnectStep::Exhausted);
        assert_eq!(coordinator.phase(), ReconnectPhase::Disconnected);
        assert_eq!(coordinator.begin_attempt(), None);

        coordinator.reset();
        assert_eq!(coordinator.phase(), ReconnectPhase::Idle);
        assert!(coordinator.begin_attempt().is_some());
    }

    #[test]
    fn session_policy_never_exhausts() {
        let mut coordinator = exact(BackoffPolicy::session());
        let mut last = ReconnectStep::Stale;
        for _ in 0..200 {
            let generation = coordinator.begin_attempt().unwrap();
            last = coordinator.failed(generation);
            assert!(matches!(last, ReconnectStep::Retry { .. }));
        }
        assert_eq!(
            last,
            ReconnectStep::Retry {
                attempt: 200,
                delay: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn stale_attempt_cannot_clobber_newer_success() {
        let mut coordinator = exact(BackoffPolicy::transport());
        let attempt_a = coordinator.begin_attempt().unwrap();
        let attempt_b = coordinator.begin_attempt().unwrap();
        assert!(attempt_b > attempt_a);

        assert!(coordinator.succeeded(attempt_b));
        let before = (coordinator.phase(), coordinator.attempt());

        assert!(!coordinator.succeeded(attempt_a));
        assert_eq!(coordinator.failed(attempt_a), ReconnectStep::Stale);
        assert_eq!((coordinator.phase(), coordinator.attempt()), before);
        assert!(coordinator.is_current(attempt_b));
    }

}
