//! Jitter strategies to prevent thundering herd on retry.

use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// No jitter - use exact backoff delay.
    None,
    /// Full jitter: random between 0 and delay.
    Full,
    /// Equal jitter: random between delay/2 and delay.
    Equal,
    /// Decorrelated jitter: AWS-style with state.
    Decorrelated { base: Duration, max: Duration },
    /// Multiply the delay by a uniform factor in `[low, high]`, then clamp to zero.
    ///
    /// `low` and `high` are expressed as millis-per-thousand (e.g. 900 = 0.9x)
    /// so the strategy stays integer-only like the rest of this module.
    BoundedFactor { low_permille: u32, high_permille: u32 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Self {
        Jitter::Decorrelated { base, max }
    }

    /// The `[0.9, 1.1]` bounded-factor jitter the retry engine defaults to.
    pub fn bounded_factor() -> Self {
        Jitter::BoundedFactor { low_permille: 900, high_permille: 1100 }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Apply jitter with a custom RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            Jitter::Equal => {
                let millis = delay.as_millis() as u64;
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                let half = millis / 2;
                Duration::from_millis(rng.gen_range(half..=millis))
            }
            Jitter::Decorrelated { base, max } => {
                let base_millis = base.as_millis() as u64;
                let delay_millis = delay.as_millis() as u64;
                let max_millis = max.as_millis() as u64;

                let upper = delay_millis.saturating_mul(3);
                let range_max = upper.min(max_millis);

                if base_millis >= range_max {
                    return Duration::from_millis(base_millis);
                }
                Duration::from_millis(rng.gen_range(base_millis..=range_max))
            }
            Jitter::BoundedFactor { low_permille, high_permille } => {
                let millis = delay.as_millis() as u64;
                let factor_permille = rng.gen_range(*low_permille..=*high_permille) as u64;
                let jittered = millis.saturating_mul(factor_permille) / 1000;
                Duration::from_millis(jittered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let jitter = Jitter::None;
        let delay = Duration::from_secs(1);
        assert_eq!(jitter.apply(delay), delay);
    }

    #[test]
    fn full_jitter_is_between_zero_and_delay() {
        let jitter = Jitter::full();
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered <= delay);
        }
    }

    #[test]
    fn bounded_factor_stays_within_ninety_to_hundred_ten_percent() {
        let jitter = Jitter::bounded_factor();
        let delay = Duration::from_millis(1000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let jittered = jitter.apply_with_rng(delay, &mut rng);
            assert!(jittered >= Duration::from_millis(900));
            assert!(jittered <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn bounded_factor_never_goes_negative() {
        let jitter = Jitter::bounded_factor();
        let jittered = jitter.apply(Duration::from_millis(0));
        assert_eq!(jittered, Duration::from_millis(0));
    }

    #[test]
    fn decorrelated_jitter_respects_bounds() {
        let jitter = Jitter::decorrelated(Duration::from_millis(100), Duration::from_secs(10));
        let delay = Duration::from_secs(1);
        for _ in 0..100 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(100));
            assert!(jittered <= Duration::from_secs(10));
        }
    }
}
