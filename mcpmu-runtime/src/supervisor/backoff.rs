//! Restart backoff for crashed servers

use std::time::Duration;

use rand::Rng;

/// Maximum automatic start attempts before the supervisor gives up
pub const MAX_START_ATTEMPTS: u32 = 5;

/// Exponential backoff with jitter for supervisor restarts.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
    cap: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RestartBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before attempt `attempt` (1-indexed): `base * 2^(attempt-1)`,
    /// capped, with ±20% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2f64.powi(attempt.saturating_sub(1) as i32);
        let raw = Duration::from_nanos((self.base.as_nanos() as f64 * multiplier) as u64);
        let capped = raw.min(self.cap);

        let jitter_factor = rand::rng().random_range(0.8..1.2);
        Duration::from_nanos((capped.as_nanos() as f64 * jitter_factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter_bounds(backoff: &RestartBackoff, attempt: u32) -> (Duration, Duration) {
        let multiplier = 2f64.powi(attempt.saturating_sub(1) as i32);
        let raw = Duration::from_nanos((backoff.base.as_nanos() as f64 * multiplier) as u64);
        let capped = raw.min(backoff.cap);
        (capped.mul_f64(0.8), capped.mul_f64(1.2))
    }

    #[test]
    fn delays_grow_exponentially_within_jitter() {
        let backoff = RestartBackoff::default();
        for attempt in 1..=6 {
            let (lo, hi) = without_jitter_bounds(&backoff, attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= lo, "attempt {attempt}: {delay:?} < {lo:?}");
            assert!(delay <= hi, "attempt {attempt}: {delay:?} > {hi:?}");
        }
    }

    #[test]
    fn delay_is_capped() {
        let backoff = RestartBackoff::default();
        // 500ms * 2^9 = 256s, far past the 30s cap.
        let delay = backoff.delay(10);
        assert!(delay <= Duration::from_secs(36)); // cap * 1.2
        assert!(delay >= Duration::from_secs(24)); // cap * 0.8
    }
}
