//! Exponential reconnect backoff with jitter.

use std::time::Duration;

/// Delay schedule for reconnect attempts: `min(seed * 2^attempt, cap)` plus jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    seed: Duration,
    cap: Duration,
    use_jitter: bool,
}

impl Backoff {
    pub fn new(seed: Duration, cap: Duration) -> Self {
        Self {
            seed,
            cap: cap.max(seed),
            use_jitter: true,
        }
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before the retry following failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let base = self.seed.saturating_mul(factor).min(self.cap);
        if self.use_jitter {
            base + jitter(base)
        } else {
            base
        }
    }
}

/// Random extra delay between 0% and 50% of `delay`
fn jitter(delay: Duration) -> Duration {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let random = RandomState::new().hash_one(std::time::SystemTime::now()) % 500;
    delay.mul_f64(random as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_cap() {
        let backoff =
            Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000)).without_jitter();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_millis(1_000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_half_of_delay() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(10));
        for attempt in 0..6 {
            let base = Duration::from_millis(200) * 2u32.pow(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 2);
        }
    }

    #[test]
    fn test_cap_never_below_seed() {
        let backoff =
            Backoff::new(Duration::from_secs(5), Duration::from_secs(1)).without_jitter();
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(5));
    }
}
