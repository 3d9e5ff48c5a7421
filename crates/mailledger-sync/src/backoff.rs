//! Reconnect delay scheduling.
//!
//! A [`BackoffScheduler`] turns a try counter into a delay. The owner asks for
//! [`BackoffScheduler::next_delay`] each time a worker dies unexpectedly and
//! calls [`BackoffScheduler::reset`] once a worker is healthy again.
//!
//! Jitter multiplies the raw delay by a uniform value in `[0, 1)` so that many
//! clients restarting after the same outage do not retry in lockstep.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Signature of a custom backoff curve: `(base_delay, num_tries) -> raw_delay`.
pub type BackoffFn = fn(Duration, u32) -> Duration;

/// How the raw delay grows with the number of tries.
#[derive(Debug, Clone, Copy, Default)]
pub enum BackoffPolicy {
    /// `base * 2^tries`.
    #[default]
    Exponential,
    /// `base * (tries + 1)`.
    Linear,
    /// Always `base`.
    Fixed,
    /// Caller supplied curve.
    Custom(BackoffFn),
}

impl BackoffPolicy {
    /// Computes the raw (unclamped, unjittered) delay.
    #[must_use]
    pub fn raw_delay(self, base: Duration, num_tries: u32) -> Duration {
        match self {
            Self::Exponential => base.saturating_mul(2u32.saturating_pow(num_tries)),
            Self::Linear => base.saturating_mul(num_tries.saturating_add(1)),
            Self::Fixed => base,
            Self::Custom(f) => f(base, num_tries),
        }
    }
}

/// Configuration for a [`BackoffScheduler`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay unit fed to the policy.
    pub base_delay: Duration,
    /// Upper bound on any returned delay.
    pub max_delay: Duration,
    /// Whether to randomize delays.
    pub jitter: bool,
    /// Growth curve.
    pub policy: BackoffPolicy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            jitter: true,
            policy: BackoffPolicy::Exponential,
        }
    }
}

/// Computes retry delays from a try counter.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    config: BackoffConfig,
    num_tries: u32,
    current_delay: Duration,
}

impl BackoffScheduler {
    /// Creates a scheduler with zeroed counters.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            num_tries: 0,
            current_delay: Duration::ZERO,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn num_tries(&self) -> u32 {
        self.num_tries
    }

    /// The delay most recently returned by [`Self::next_delay`].
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Computes, records and returns the next delay.
    ///
    /// The result is always within `[0, max_delay]`.
    pub fn next_delay(&mut self) -> Duration {
        let raw = self
            .config
            .policy
            .raw_delay(self.config.base_delay, self.num_tries);

        let delay = if self.config.jitter {
            let factor: f64 = rand::random();
            Duration::try_from_secs_f64(raw.as_secs_f64() * factor).unwrap_or(Duration::MAX)
        } else {
            raw
        };

        self.current_delay = delay.min(self.config.max_delay);
        self.num_tries = self.num_tries.saturating_add(1);
        self.current_delay
    }

    /// Clears the try counter and the current delay.
    pub const fn reset(&mut self) {
        self.num_tries = 0;
        self.current_delay = Duration::ZERO;
    }
}

/// A [`BackoffScheduler`] fixed to exponential doubling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff(BackoffScheduler);

impl ExponentialBackoff {
    /// Creates an exponential scheduler.
    #[must_use]
    pub const fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self(BackoffScheduler::new(BackoffConfig {
            base_delay,
            max_delay,
            jitter,
            policy: BackoffPolicy::Exponential,
        }))
    }

    /// Unwraps into the general scheduler.
    #[must_use]
    pub fn into_inner(self) -> BackoffScheduler {
        self.0
    }
}

impl Deref for ExponentialBackoff {
    type Target = BackoffScheduler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ExponentialBackoff {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_exponential_without_jitter() {
        let mut backoff = ExponentialBackoff::new(ms(1000), ms(5000), false);

        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays, vec![ms(1000), ms(2000), ms(4000), ms(5000)]);
        assert_eq!(backoff.num_tries(), 4);
        assert_eq!(backoff.current_delay(), ms(5000));
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let mut backoff = ExponentialBackoff::new(ms(10), ms(1000), false);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();

        assert_eq!(backoff.num_tries(), 0);
        assert_eq!(backoff.current_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), ms(10));
    }

    #[test]
    fn test_linear_and_fixed_policies() {
        let mut linear = BackoffScheduler::new(BackoffConfig {
            base_delay: ms(100),
            max_delay: ms(250),
            jitter: false,
            policy: BackoffPolicy::Linear,
        });
        assert_eq!(linear.next_delay(), ms(100));
        assert_eq!(linear.next_delay(), ms(200));
        assert_eq!(linear.next_delay(), ms(250));

        let mut fixed = BackoffScheduler::new(BackoffConfig {
            base_delay: ms(300),
            max_delay: ms(1000),
            jitter: false,
            policy: BackoffPolicy::Fixed,
        });
        assert_eq!(fixed.next_delay(), ms(300));
        assert_eq!(fixed.next_delay(), ms(300));
    }

    #[test]
    fn test_custom_policy() {
        fn squares(base: Duration, tries: u32) -> Duration {
            base * (tries + 1) * (tries + 1)
        }
        let mut backoff = BackoffScheduler::new(BackoffConfig {
            base_delay: ms(10),
            max_delay: ms(1000),
            jitter: false,
            policy: BackoffPolicy::Custom(squares),
        });
        assert_eq!(backoff.next_delay(), ms(10));
        assert_eq!(backoff.next_delay(), ms(40));
        assert_eq!(backoff.next_delay(), ms(90));
    }

    #[test]
    fn test_many_tries_saturate_at_max() {
        let mut backoff = ExponentialBackoff::new(ms(1000), ms(60_000), false);
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current_delay(), ms(60_000));
        assert_eq!(backoff.num_tries(), 200);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(
            base in 0u64..100_000,
            max in 0u64..1_000_000,
            calls in 1usize..80,
            jitter in any::<bool>(),
        ) {
            let mut backoff = ExponentialBackoff::new(ms(base), ms(max), jitter);
            for _ in 0..calls {
                let delay = backoff.next_delay();
                prop_assert!(delay <= ms(max));
            }
        }

        #[test]
        fn prop_unjittered_matches_formula(base in 1u64..10_000, max in 1u64..10_000_000, k in 0u32..20) {
            let mut backoff = ExponentialBackoff::new(ms(base), ms(max), false);
            let mut last = Duration::ZERO;
            for _ in 0..=k {
                last = backoff.next_delay();
            }
            let expected = ms(base * 2u64.pow(k)).min(ms(max));
            prop_assert_eq!(last, expected);
        }
    }
}
