//! Shared retry/backoff policy for handler attempts.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a cap and optional uniform jitter.
///
/// `delay_for(n)` for attempt `n` (1-indexed) is
/// `min(cap, base * 2^(n-1) + jitter)` where jitter is drawn uniformly from
/// `[0, jitter_secs)`. Attempts are counted per event, not per workflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_secs: f64,
    pub cap_secs: f64,
    pub jitter_secs: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 1.0,
            cap_secs: 60.0,
            jitter_secs: 0.75,
        }
    }
}

impl BackoffPolicy {
    pub const fn new(base_secs: f64, cap_secs: f64, jitter_secs: f64) -> Self {
        Self {
            base_secs,
            cap_secs,
            jitter_secs,
        }
    }

    /// Zero-delay policy for tests and eager replays.
    pub const fn none() -> Self {
        Self {
            base_secs: 0.0,
            cap_secs: 0.0,
            jitter_secs: 0.0,
        }
    }

    /// Delay before retrying after `attempt` failures (1-indexed; values
    /// below 1 are clamped to 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exp = self.base_secs * 2f64.powi(attempt as i32 - 1);
        let jitter = if self.jitter_secs > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_secs)
        } else {
            0.0
        };
        Duration::from_secs_f64((exp + jitter).min(self.cap_secs).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let policy = BackoffPolicy::new(1.0, 60.0, 0.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn attempt_zero_is_treated_as_one() {
        let policy = BackoffPolicy::new(1.0, 60.0, 0.0);
        assert_eq!(policy.delay_for(0), policy.delay_for(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(1.0, 60.0, 0.75);
        for _ in 0..64 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((1.0..1.75).contains(&delay), "delay out of range: {delay}");
        }
    }

    #[test]
    fn none_never_sleeps() {
        let policy = BackoffPolicy::none();
        for attempt in 0..8 {
            assert_eq!(policy.delay_for(attempt), Duration::ZERO);
        }
    }
}
