//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter.
///
/// ```text
/// delay(0) = 0
/// delay(n) = min(max, initial · rateⁿ + uniform(0, initial))
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub rate: u32,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            rate: 2,
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(5),
            rate: 2,
            max: Duration::from_millis(500),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let jitter = if self.initial.is_zero() {
            Duration::ZERO
        } else {
            rng.gen_range(Duration::ZERO..self.initial)
        };
        let factor = self.rate.checked_pow(failures).unwrap_or(u32::MAX);
        self.initial
            .saturating_mul(factor)
            .saturating_add(jitter)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_no_failures_means_immediate() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.delay(0, &mut StepRng::new(0, 0)), Duration::ZERO);
    }

    #[test]
    fn test_grows_exponentially() {
        let cfg = BackoffConfig::default();
        let mut rng = StepRng::new(0, 0);
        assert_eq!(cfg.delay(1, &mut rng), Duration::from_millis(100));
        assert_eq!(cfg.delay(2, &mut rng), Duration::from_millis(200));
        assert_eq!(cfg.delay(5, &mut rng), Duration::from_millis(1600));
    }

    #[test]
    fn test_capped_at_max() {
        let cfg = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(cfg.delay(20, &mut rng), Duration::from_secs(300));
        assert_eq!(cfg.delay(u32::MAX, &mut rng), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_below_initial() {
        let cfg = BackoffConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let d = cfg.delay(1, &mut rng);
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(150), "{d:?}");
        }
    }
}
