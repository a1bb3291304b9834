//! Exponential backoff policy
//!
//! Delays grow as `min * factor^attempt`, capped at `max`. With jitter
//! enabled the delay is drawn uniformly from `[min, computed]` so a fleet of
//! consumers retrying the same outage does not stampede in lockstep.

use std::time::Duration;

/// Capped exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay for the first attempt, and the floor for every attempt.
    pub min: Duration,
    /// Ceiling for the computed delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Randomize each delay into `[min, computed]`.
    pub jitter: bool,
}

impl Backoff {
    /// Create a backoff policy with jitter enabled.
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max,
            factor,
            jitter: true,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for the given zero-based attempt number.
    pub fn for_attempt(&self, attempt: i64) -> Duration {
        let min = self.min.as_secs_f64();
        let max = self.max.as_secs_f64();

        let exponent = attempt.clamp(0, 1024) as i32;
        let mut delay = min * self.factor.powi(exponent);
        if self.jitter {
            delay = min + (delay - min) * rand::random::<f64>();
        }
        if !delay.is_finite() || delay > max {
            delay = max;
        }
        if delay < min {
            delay = min;
        }

        Duration::from_secs_f64(delay)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_without_jitter() {
        let backoff = Backoff::default().with_jitter(false);

        assert_eq!(backoff.for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = Backoff::default().with_jitter(false);

        assert_eq!(backoff.for_attempt(10), Duration::from_secs(10));
        assert_eq!(backoff.for_attempt(5000), Duration::from_secs(10));
    }

    #[test]
    fn test_negative_attempt_uses_min() {
        let backoff = Backoff::default().with_jitter(false);
        assert_eq!(backoff.for_attempt(-3), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1), 2.0);

        for attempt in 0..8 {
            let delay = backoff.for_attempt(attempt);
            assert!(delay >= backoff.min, "attempt {attempt}: {delay:?} below min");
            assert!(delay <= backoff.max, "attempt {attempt}: {delay:?} above max");
        }
    }
}
