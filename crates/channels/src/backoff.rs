//! Reconnect policy with jittered exponential back-off.
//!
//! Backoff state is per-channel: it resets on every successful connect
//! and gives up (returns `None`) once the attempt cap is reached.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub factor: f64,
    /// Give up after this many consecutive failures. `0` = unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            max_attempts: 10,
        }
    }
}

/// Per-channel reconnect bookkeeping.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// The delay to sleep before the next attempt, or `None` once the
    /// attempt cap is reached. Advances the attempt counter.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.policy.max_attempts > 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Milliseconds variant of [`Self::next_backoff`].
    pub fn next_backoff_ms(&mut self) -> Option<u64> {
        self.next_backoff().map(|d| d.as_millis() as u64)
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.policy.factor.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.policy.max_delay.as_millis() as f64);

        // ~25% deterministic jitter spreads reconnect storms while keeping
        // tests reproducible.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

/// Cheap deterministic "random" fraction [0, 1) from the attempt number
/// (Knuth multiplicative hash).
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761);
    (hash as f64) / (u32::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_until_cap() {
        let mut b = ReconnectBackoff::new(BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_attempts: 0,
        });
        let d0 = b.next_backoff().unwrap();
        let d1 = b.next_backoff().unwrap();
        let d2 = b.next_backoff().unwrap();
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_with_jitter_margin() {
        let mut b = ReconnectBackoff::new(BackoffPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            factor: 10.0,
            max_attempts: 0,
        });
        for _ in 0..10 {
            let d = b.next_backoff().unwrap();
            // max_delay + 25% jitter ceiling.
            assert!(d <= Duration::from_millis(37_500));
        }
    }

    #[test]
    fn none_at_attempt_cap() {
        let mut b = ReconnectBackoff::new(BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        });
        assert!(b.next_backoff_ms().is_some());
        assert!(b.next_backoff_ms().is_some());
        assert!(b.next_backoff_ms().is_some());
        assert!(b.next_backoff_ms().is_none());
        assert!(b.next_backoff_ms().is_none());
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut b = ReconnectBackoff::new(BackoffPolicy {
            max_attempts: 2,
            ..Default::default()
        });
        b.next_backoff();
        b.next_backoff();
        assert!(b.next_backoff().is_none());

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert!(b.next_backoff().is_some());
    }

    #[test]
    fn unlimited_never_gives_up() {
        let mut b = ReconnectBackoff::new(BackoffPolicy {
            max_attempts: 0,
            ..Default::default()
        });
        for _ in 0..1000 {
            assert!(b.next_backoff().is_some());
        }
    }

    #[test]
    fn jitter_is_deterministic() {
        let mut a = ReconnectBackoff::default();
        let mut b = ReconnectBackoff::default();
        assert_eq!(a.next_backoff(), b.next_backoff());
        assert_eq!(a.next_backoff(), b.next_backoff());
    }
}
