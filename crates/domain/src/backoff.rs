//! Retry schedule shared by transport reconnects and checkpoint submission.
//!
//! Delays double from `base` up to `cap`, plus up to a quarter of jitter.
//! The jitter is derived from the attempt number and a per-session seed, so
//! sessions that lose the same host at the same moment do not retry in
//! lockstep.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    /// Attempts before giving up.  `0` retries forever.
    pub max_attempts: u32,
    seed: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(500, 30_000, 5)
    }
}

impl Backoff {
    /// `cap_ms` below `base_ms` is raised to `base_ms`.
    pub fn from_millis(base_ms: u64, cap_ms: u64, max_attempts: u32) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms.max(base_ms)),
            max_attempts,
            seed: 0,
        }
    }

    /// Derive the jitter from `key` (typically the session id).
    pub fn seeded(mut self, key: &str) -> Self {
        // FNV-1a
        self.seed = key.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        });
        self
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let doubled = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = doubled.min(cap_ms);
        let jitter = (capped as f64 * 0.25 * self.jitter_fraction(attempt)) as u64;
        Duration::from_millis(capped.saturating_add(jitter))
    }

    /// `attempt` is the 1-based count of failures so far.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    /// Fraction in [0, 1).  Spreads retries; not a source of randomness.
    fn jitter_fraction(&self, attempt: u32) -> f64 {
        let mut x = self.seed ^ u64::from(attempt).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
        x ^= x >> 33;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_transport_section() {
        let b = Backoff::default();
        assert_eq!(b.base, Duration::from_millis(500));
        assert_eq!(b.cap, Duration::from_secs(30));
        assert_eq!(b.max_attempts, 5);
    }

    #[test]
    fn delays_double_within_jitter() {
        let b = Backoff::from_millis(100, 10_000, 0);
        for (attempt, floor) in [(0u32, 100u64), (1, 200), (2, 400), (3, 800)] {
            let d = b.delay_for_attempt(attempt).as_millis() as u64;
            assert!(d >= floor && d <= floor + floor / 4, "attempt {attempt}: {d}ms");
        }
    }

    #[test]
    fn delay_never_exceeds_cap_plus_jitter() {
        let b = Backoff::from_millis(10_000, 30_000, 0);
        for attempt in [2, 10, 63, 64, u32::MAX] {
            assert!(b.delay_for_attempt(attempt) <= Duration::from_millis(37_500));
        }
    }

    #[test]
    fn seeds_decorrelate_sessions() {
        let a = Backoff::from_millis(1_000, 60_000, 0).seeded("session-a");
        let b = Backoff::from_millis(1_000, 60_000, 0).seeded("session-b");
        let differs = (0..8).any(|n| a.delay_for_attempt(n) != b.delay_for_attempt(n));
        assert!(differs);
        assert_eq!(a.delay_for_attempt(3), a.clone().delay_for_attempt(3));
    }

    #[test]
    fn gives_up_at_the_limit() {
        let b = Backoff::from_millis(10, 10, 3);
        assert!(!b.should_give_up(2));
        assert!(b.should_give_up(3));
        assert!(!Backoff::from_millis(10, 10, 0).should_give_up(1_000_000));
    }

    #[test]
    fn cap_is_raised_to_base() {
        assert_eq!(Backoff::from_millis(2_000, 500, 3).cap, Duration::from_millis(2_000));
    }
}
