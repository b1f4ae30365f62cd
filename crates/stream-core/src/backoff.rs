//! Exponential backoff with jitter
//!
//! `delay = min(cap, base * 2^(attempt-1))`, then jittered by a symmetric
//! fraction. Attempts are 1-based.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Symmetric jitter fraction, e.g. 0.25 for ±25%.
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Physical connection: 1s base, 30s cap, ten attempts.
    pub fn transport() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_attempts: Some(10),
            jitter: 0.25,
        }
    }

    /// Per-session resubscribe: 250ms base, 4s cap, bounded by the transport.
    pub fn session() -> Self {
        Self {
            base_ms: 250,
            cap_ms: 4_000,
            max_attempts: None,
            jitter: 0.25,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay for `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms);
        Duration::from_millis(millis)
    }

    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        nominal.mul_f64(factor.max(0.0))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, &mut rand::thread_rng())
    }

    /// True once `attempt` is past the configured maximum.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn transport_schedule_doubles_to_cap() {
        let policy = BackoffPolicy::transport();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| policy.nominal_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn session_schedule_caps_at_four_seconds() {
        let policy = BackoffPolicy::session();
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(250));
        assert_eq!(policy.nominal_delay(5), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(500), Duration::from_secs(4));
        assert!(!policy.exhausted(10_000));
    }

    #[test]
    fn nominal_delay_is_monotonic() {
        let policy = BackoffPolicy::transport();
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = policy.nominal_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let policy = BackoffPolicy::transport();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1_000 {
            let delay = policy.jittered_delay(1, &mut rng);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1_250), "{delay:?}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = BackoffPolicy::session().with_jitter(0.0);
        assert_eq!(policy.delay(3), Duration::from_secs(1));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let policy = BackoffPolicy::transport();
        assert!(!policy.exhausted(10));
        assert!(policy.exhausted(11));
    }
}
