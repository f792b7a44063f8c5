use std::fmt;
use std::time::Duration;

/// Computes the delay before a task is attempted again.
///
/// Implementations must be pure: the same attempt number always yields the same delay.
pub trait BackoffStrategy: fmt::Debug + Send + Sync {
    /// Returns the delay to wait after the given failed attempt.
    ///
    /// `attempt` is 1-based: after the first failed attempt, this is called with `1`.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with an upper bound.
///
/// The delay after attempt `n` is `initial * multiplier^(n - 1)`, capped at `max`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use beacon_common::{BackoffStrategy, ExponentialBackoff};
///
/// let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
/// assert_eq!(backoff.delay(1), Duration::from_secs(1));
/// assert_eq!(backoff.delay(2), Duration::from_secs(2));
/// assert_eq!(backoff.delay(3), Duration::from_secs(4));
/// assert_eq!(backoff.delay(4), Duration::from_secs(5));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
}

impl ExponentialBackoff {
    /// Creates a doubling backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            max: max.max(initial),
        }
    }

    /// Overrides the growth factor. Values below `1.0` are treated as `1.0`.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    /// Returns the delay used after the first failure.
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Returns the upper bound of the delay.
    pub fn max(&self) -> Duration {
        self.max
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }

        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        let delays: Vec<_> = (1..=6).map(|attempt| backoff.delay(attempt)).collect();
        assert_eq!(
            delays,
            [
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_attempt_zero_uses_initial() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(3));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_custom_multiplier() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(100))
            .multiplier(3.0);
        assert_eq!(backoff.delay(3), Duration::from_secs(9));

        let flat = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(100))
            .multiplier(0.5);
        assert_eq!(flat.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn test_max_below_initial() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(5));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
    }
}
