//! Retry delay policy and poll jitter.

use std::time::Duration;

use common::config::PollingConfig;
use common::ErrorKind;
use rand::Rng;

/// Longest `retry_after` honoured from the provider.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Exponential backoff with a cap: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_config(cfg: &PollingConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.backoff_base_secs),
            Duration::from_secs(cfg.backoff_max_secs),
        )
    }

    /// Delay after a failure, where `attempt` counts the consecutive
    /// failures before this one.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Like [`delay`](Self::delay), but a provider `retry_after` wins when it
    /// asks for longer, up to [`MAX_RETRY_AFTER`].
    pub fn delay_for(&self, attempt: u32, kind: &ErrorKind) -> Duration {
        let computed = self.delay(attempt);
        match kind {
            ErrorKind::RateLimited {
                retry_after: Some(after),
            } if *after > computed => (*after).min(MAX_RETRY_AFTER.max(computed)),
            _ => computed,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(30 * 60))
    }
}

/// `interval` shifted by a random offset within `±ratio * interval`.
pub fn jittered(interval: Duration, ratio: f64, rng: &mut impl Rng) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    let secs = interval.as_secs_f64();
    let spread = secs * ratio;
    if spread <= 0.0 {
        return interval;
    }
    let offset = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((secs + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_then_cap() {
        let policy = BackoffPolicy::new(Duration::from_secs(30), Duration::from_secs(1800));
        let delays: Vec<u64> = (0..9).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480, 960, 1800, 1800, 1800]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(64), Duration::from_secs(1800));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn test_retry_after_only_wins_when_larger() {
        let policy = BackoffPolicy::default();
        let longer = ErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(600)),
        };
        let shorter = ErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        let absent = ErrorKind::RateLimited { retry_after: None };

        assert_eq!(policy.delay_for(0, &longer), Duration::from_secs(600));
        assert_eq!(policy.delay_for(1, &shorter), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2, &absent), Duration::from_secs(120));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = BackoffPolicy::default();
        let forever = ErrorKind::RateLimited {
            retry_after: Some(Duration::from_secs(u64::MAX)),
        };
        assert_eq!(policy.delay_for(0, &forever), MAX_RETRY_AFTER);
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let mut rng = rand::thread_rng();
        let interval = Duration::from_secs(300);
        for _ in 0..200 {
            let d = jittered(interval, 0.1, &mut rng);
            assert!(d >= Duration::from_secs(270) && d <= Duration::from_secs(330), "{d:?}");
        }
        assert_eq!(jittered(interval, 0.0, &mut rng), interval);
    }
}
