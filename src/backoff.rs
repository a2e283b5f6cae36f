//! Backoff strategies for the retry engine.

use std::time::Duration;

/// Backoff strategy for computing the delay before a retry attempt.
///
/// `delay(n)` is 1-indexed: `n` is the attempt about to be retried, not the
/// attempt that just failed.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed { base: Duration, max: Option<Duration> },
    /// Linearly increasing delay: `base * n`.
    Linear { base: Duration, max: Option<Duration> },
    /// Exponentially increasing delay: `base * 2^(n-1)`.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Backoff::Fixed { base, max: None }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: None }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap the computed delay, regardless of strategy.
    pub fn with_max(self, max: Duration) -> Self {
        match self {
            Backoff::Fixed { base, .. } => Backoff::Fixed { base, max: Some(max) },
            Backoff::Linear { base, .. } => Backoff::Linear { base, max: Some(max) },
            Backoff::Exponential { base, .. } => Backoff::Exponential { base, max: Some(max) },
        }
    }

    /// Calculate the delay for a given attempt number (1-indexed), before jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let (raw, max) = match self {
            Backoff::Fixed { base, max } => (*base, *max),
            Backoff::Linear { base, max } => {
                let d = base
                    .checked_mul(attempt as u32)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                (d, *max)
            }
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                let d = base
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                (d, *max)
            }
        };
        match max {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_returns_same_delay() {
        let backoff = Backoff::fixed(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(100), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn max_cap_applies_uniformly() {
        let fixed = Backoff::fixed(Duration::from_secs(5)).with_max(Duration::from_secs(1));
        assert_eq!(fixed.delay(1), Duration::from_secs(1));

        let linear = Backoff::linear(Duration::from_secs(1)).with_max(Duration::from_secs(2));
        assert_eq!(linear.delay(5), Duration::from_secs(2));

        let exp = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1));
        assert_eq!(exp.delay(5), Duration::from_secs(1));
        assert_eq!(exp.delay(10), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        let delay = backoff.delay(64);
        assert!(delay > Duration::from_secs(1_000_000));
    }
}
