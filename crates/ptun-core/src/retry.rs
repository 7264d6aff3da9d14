//! Retry delays
//!
//! A [`RetryDelay`] describes how long to wait between successive retry
//! attempts. Calling [`RetryDelay::iter`] yields a fresh, single-pass
//! sequence of wait durations; restarting the sequence means asking the
//! policy for a new iterator.

use rand::Rng;
use std::time::Duration;

/// Backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// Never wait to retry: the sequence is empty.
    Never,

    /// Constant delay, forever.
    Constant(Duration),

    /// Exponential backoff, capped at `max_delay` when set.
    ExponentialBackoff {
        initial: Duration,
        multiplier: u32,
        max_delay: Option<Duration>,
    },

    /// Exponential backoff where every value is randomized within
    /// `[value / 2, value]`.
    ExponentialBackoffWithJitter {
        initial: Duration,
        multiplier: u32,
        max_delay: Option<Duration>,
    },
}

impl RetryDelay {
    /// Exponential backoff with jitter: 2s, 4s, 8s, 8s, ...
    pub fn default_backoff() -> Self {
        RetryDelay::ExponentialBackoffWithJitter {
            initial: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Some(Duration::from_secs(8)),
        }
    }

    /// Start a new delay sequence
    pub fn iter(&self) -> RetryDelayIter {
        let inner = match *self {
            RetryDelay::Never => DelayState::Never,
            RetryDelay::Constant(delay) => DelayState::Constant(delay),
            RetryDelay::ExponentialBackoff {
                initial,
                multiplier,
                max_delay,
            } => DelayState::Backoff(ExponentialBackoff::new(initial, multiplier, max_delay)),
            RetryDelay::ExponentialBackoffWithJitter {
                initial,
                multiplier,
                max_delay,
            } => DelayState::Jittered(ExponentialBackoff::new(initial, multiplier, max_delay)),
        };

        RetryDelayIter { inner }
    }
}

/// Lazy, possibly infinite sequence of retry delays.
#[derive(Debug, Clone)]
pub struct RetryDelayIter {
    inner: DelayState,
}

#[derive(Debug, Clone)]
enum DelayState {
    Never,
    Constant(Duration),
    Backoff(ExponentialBackoff),
    Jittered(ExponentialBackoff),
}

impl Iterator for RetryDelayIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        match &mut self.inner {
            DelayState::Never => None,
            DelayState::Constant(delay) => Some(*delay),
            DelayState::Backoff(backoff) => backoff.next(),
            DelayState::Jittered(backoff) => backoff.next().map(jitter),
        }
    }
}

#[derive(Debug, Clone)]
struct ExponentialBackoff {
    next: Duration,
    multiplier: u32,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    fn new(initial: Duration, multiplier: u32, max_delay: Option<Duration>) -> Self {
        Self {
            next: initial,
            multiplier,
            max_delay,
        }
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_delay {
            Some(max_delay) => delay.min(max_delay),
            None => delay,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.cap(self.next);
        self.next = self.cap(current.saturating_mul(self.multiplier));
        Some(current)
    }
}

/// Pick a uniformly random delay in `[delay / 2, delay]`.
fn jitter(delay: Duration) -> Duration {
    let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return delay;
    }
    let jittered = rand::thread_rng().gen_range(nanos / 2..=nanos);
    Duration::from_nanos(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_never_is_empty() {
        let mut iter = RetryDelay::Never.iter();
        assert_eq!(iter.next(), None);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_constant_repeats() {
        let delays: Vec<_> = RetryDelay::Constant(secs(3)).iter().take(4).collect();
        assert_eq!(delays, vec![secs(3); 4]);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = RetryDelay::ExponentialBackoff {
            initial: secs(2),
            multiplier: 2,
            max_delay: Some(secs(8)),
        };
        let delays: Vec<_> = policy.iter().take(6).collect();
        assert_eq!(delays, vec![secs(2), secs(4), secs(8), secs(8), secs(8), secs(8)]);
    }

    #[test]
    fn test_exponential_backoff_unbounded() {
        let policy = RetryDelay::ExponentialBackoff {
            initial: secs(1),
            multiplier: 3,
            max_delay: None,
        };
        let delays: Vec<_> = policy.iter().take(4).collect();
        assert_eq!(delays, vec![secs(1), secs(3), secs(9), secs(27)]);
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let policy = RetryDelay::ExponentialBackoff {
            initial: Duration::MAX / 2,
            multiplier: 4,
            max_delay: None,
        };
        let delays: Vec<_> = policy.iter().take(3).collect();
        assert_eq!(delays[1], Duration::MAX);
        assert_eq!(delays[2], Duration::MAX);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryDelay::ExponentialBackoffWithJitter {
            initial: secs(2),
            multiplier: 2,
            max_delay: Some(secs(8)),
        };
        let bounds = [secs(2), secs(4), secs(8), secs(8), secs(8)];
        for _ in 0..50 {
            for (delay, bound) in policy.iter().zip(bounds) {
                assert!(delay <= bound, "{delay:?} exceeds {bound:?}");
                assert!(delay >= bound / 2, "{delay:?} below {:?}", bound / 2);
            }
        }
    }

    #[test]
    fn test_iterators_are_independent() {
        let policy = RetryDelay::ExponentialBackoff {
            initial: secs(1),
            multiplier: 2,
            max_delay: None,
        };
        let mut first = policy.iter();
        first.next();
        first.next();

        assert_eq!(policy.iter().next(), Some(secs(1)));
        assert_eq!(first.next(), Some(secs(4)));
    }
}
