// Reconnect Backoff
// Exponential doubling from base to cap with bounded downward jitter

use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Exponential backoff with downward jitter.
///
/// The n-th delay is `min(base * 2^n, cap) * (1 - u * jitter)` with `u` uniform
/// in `[0, 1]`. Jitter is kept below 0.5, so each uncapped delay is strictly
/// longer than the previous one.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 0.49),
            attempt: 0,
        }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let exp_pow = self.attempt.min(63);
        let multiplier = 1u64.checked_shl(exp_pow).unwrap_or(u64::MAX);
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let cap_ms = self.cap.as_millis().min(u64::MAX as u128) as u64;
        let exp_ms = base_ms.saturating_mul(multiplier).min(cap_ms);

        let factor = if self.jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            1.0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_nanos((exp_ms as f64 * 1_000_000.0 * factor) as u64)
    }

    /// Back to base after a successful subscribe
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backoff(base={:?}, cap={:?}, jitter={:.2}, attempt={})",
            self.base, self.cap, self.jitter, self.attempt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_strictly_increase_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 0.4);
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        assert!(first < second, "{:?} !< {:?}", first, second);
        assert!(second < third, "{:?} !< {:?}", second, third);
        assert!(third <= Duration::from_secs(10));
    }

    #[test]
    fn test_delays_never_exceed_cap() {
        let cap = Duration::from_millis(500);
        let mut backoff = Backoff::new(Duration::from_millis(100), cap, 0.1);
        for _ in 0..100 {
            assert!(backoff.next_delay() <= cap);
        }
        assert_eq!(backoff.attempt(), 100);
    }

    #[test]
    fn test_reset_returns_to_base() {
        let base = Duration::from_millis(200);
        let mut backoff = Backoff::new(base, Duration::from_secs(5), 0.1);
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= base);
        assert!(delay >= Duration::from_millis(179));
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(150), 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));
    }

    #[test]
    fn test_huge_attempt_count_saturates() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
