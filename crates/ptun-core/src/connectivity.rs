//! Connectivity Adaptor
//!
//! Decides, after the tunnel lost connectivity, whether the owning
//! controller should reconnect now, wait, or give up ("throttle").
//!
//! # Policy
//!
//! 1. The first `initial_immediate_attempts` reconnections happen
//!    back-to-back, without delay.
//! 2. Subsequent attempts are spaced by the strategy's [`RetryDelay`].
//! 3. Once `timeout` has elapsed since the first loss, or the delay
//!    sequence runs dry, every call throttles until [`reset`] is called.
//!
//! The adaptor is not thread-safe; the controller serializes all calls.
//!
//! [`reset`]: ConnectivityAdaptor::reset

use crate::retry::{RetryDelay, RetryDelayIter};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Reconnection strategy supplied by the owning controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Number of attempts made back-to-back before backing off
    pub initial_immediate_attempts: u32,
    /// Delay policy applied after the immediate attempts
    pub delay: RetryDelay,
    /// Total time budget, measured from the first connectivity loss
    pub timeout: Duration,
}

impl RetryStrategy {
    /// Strategy with the given immediate attempts, delay policy and budget.
    pub fn new(initial_immediate_attempts: u32, delay: RetryDelay, timeout: Duration) -> Self {
        Self {
            initial_immediate_attempts,
            delay,
            timeout,
        }
    }

    fn make_delay_iter(&self) -> RetryDelayIter {
        self.delay.iter()
    }
}

/// Outcome of a single [`ConnectivityAdaptorManager::poll`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Not yet time for the next attempt
    Wait { until: Instant },
    /// Reconnect now
    Reconnect,
    /// Reconnect now; the delay sequence is exhausted so this was the last attempt
    ReconnectExhausted,
    /// Give up until reset
    Throttle,
}

/// Interface the packet tunnel controller drives on connectivity loss.
pub trait ConnectivityAdaptor {
    fn retry_strategy(&self) -> &RetryStrategy;

    /// Invoke exactly the callbacks the current state calls for.
    fn handle(&mut self, on_reconnecting: &mut dyn FnMut(), on_throttling: &mut dyn FnMut());

    /// Forget the current loss episode after a successful reconnection.
    fn reset(&mut self);
}

/// Mutable state of one loss episode
#[derive(Debug)]
struct ConnectivityState {
    attempt_count: u32,
    expiry_deadline: Option<Instant>,
    next_attempt_at: Option<Instant>,
    delay_iter: RetryDelayIter,
    exhausted: bool,
}

impl ConnectivityState {
    fn new(strategy: &RetryStrategy) -> Self {
        Self {
            attempt_count: 0,
            expiry_deadline: None,
            next_attempt_at: None,
            delay_iter: strategy.make_delay_iter(),
            exhausted: false,
        }
    }
}

/// Default [`ConnectivityAdaptor`] backed by a [`RetryStrategy`].
#[derive(Debug)]
pub struct ConnectivityAdaptorManager {
    strategy: RetryStrategy,
    state: ConnectivityState,
}

impl ConnectivityAdaptorManager {
    /// Start in the connected state.
    pub fn new(strategy: RetryStrategy) -> Self {
        let state = ConnectivityState::new(&strategy);
        Self { strategy, state }
    }

    /// Number of reconnection attempts made in the current episode
    pub fn attempt_count(&self) -> u32 {
        self.state.attempt_count
    }

    /// When the next attempt is due, if one is scheduled
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.state.next_attempt_at
    }

    /// Advance the state machine as of `now`.
    pub fn poll(&mut self, now: Instant) -> Decision {
        let state = &mut self.state;

        if state.attempt_count == 0 && state.expiry_deadline.is_none() {
            state.expiry_deadline = Some(now + self.strategy.timeout);
            debug!("Connectivity lost, giving up after {:?}", self.strategy.timeout);
        }

        if state.attempt_count == 0 || state.attempt_count < self.strategy.initial_immediate_attempts
        {
            state.next_attempt_at = Some(now);
        }

        let expired = state.expiry_deadline.is_none_or(|deadline| now > deadline);
        if expired || state.exhausted {
            return Decision::Throttle;
        }

        let Some(next_attempt_at) = state.next_attempt_at else {
            return Decision::Throttle;
        };
        if now < next_attempt_at {
            return Decision::Wait {
                until: next_attempt_at,
            };
        }

        state.attempt_count += 1;
        if state.attempt_count < self.strategy.initial_immediate_attempts {
            return Decision::Reconnect;
        }

        match state.delay_iter.next() {
            Some(delay) => {
                state.next_attempt_at = Some(now + delay);
                debug!(
                    "Reconnect attempt {}, next one in {:?}",
                    state.attempt_count, delay
                );
                Decision::Reconnect
            }
            None => {
                info!(
                    "No more retry delays after {} attempts, throttling",
                    state.attempt_count
                );
                state.exhausted = true;
                state.next_attempt_at = None;
                Decision::ReconnectExhausted
            }
        }
    }
}

impl ConnectivityAdaptor for ConnectivityAdaptorManager {
    fn retry_strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    fn handle(&mut self, on_reconnecting: &mut dyn FnMut(), on_throttling: &mut dyn FnMut()) {
        match self.poll(Instant::now()) {
            Decision::Wait { .. } => {}
            Decision::Reconnect => on_reconnecting(),
            Decision::ReconnectExhausted => {
                on_reconnecting();
                on_throttling();
            }
            Decision::Throttle => on_throttling(),
        }
    }

    fn reset(&mut self) {
        self.state = ConnectivityState::new(&self.strategy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnecting_before_five_times() {
        let strategy = RetryStrategy::new(5, RetryDelay::Never, Duration::from_secs(30));
        let mut adaptor = ConnectivityAdaptorManager::new(strategy);

        let mut reconnects = 0;
        let mut throttled = false;
        while !throttled {
            adaptor.handle(&mut || reconnects += 1, &mut || throttled = true);
        }

        assert_eq!(reconnects, 5);
    }

    #[test]
    fn test_throttling_is_permanent_until_reset() {
        let strategy = RetryStrategy::new(2, RetryDelay::Never, Duration::from_secs(30));
        let mut adaptor = ConnectivityAdaptorManager::new(strategy);
        let now = Instant::now();

        assert_eq!(adaptor.poll(now), Decision::Reconnect);
        assert_eq!(adaptor.poll(now), Decision::ReconnectExhausted);
        for _ in 0..10 {
            assert_eq!(adaptor.poll(now), Decision::Throttle);
        }

        adaptor.reset();
        assert_eq!(adaptor.attempt_count(), 0);
        assert_eq!(adaptor.poll(now), Decision::Reconnect);
    }

    #[test]
    fn test_throttling_after_timeout() {
        let strategy = RetryStrategy::new(
            5,
            RetryDelay::ExponentialBackoffWithJitter {
                initial: Duration::from_secs(5),
                multiplier: 2,
                max_delay: None,
            },
            Duration::from_secs(60),
        );
        let mut adaptor = ConnectivityAdaptorManager::new(strategy);
        let start = Instant::now();

        assert_eq!(adaptor.poll(start), Decision::Reconnect);

        let later = start + Duration::from_secs(61);
        for _ in 0..20 {
            assert_eq!(adaptor.poll(later), Decision::Throttle);
        }
    }

    #[test]
    fn test_backoff_schedules_next_attempt() {
        let strategy = RetryStrategy::new(
            2,
            RetryDelay::ExponentialBackoff {
                initial: Duration::from_secs(15),
                multiplier: 2,
                max_delay: Some(Duration::from_secs(60)),
            },
            Duration::from_secs(300),
        );
        let mut adaptor = ConnectivityAdaptorManager::new(strategy);
        let start = Instant::now();

        assert_eq!(adaptor.poll(start), Decision::Reconnect);
        assert_eq!(adaptor.poll(start), Decision::Reconnect);
        assert_eq!(adaptor.next_attempt_at(), Some(start + Duration::from_secs(15)));

        let early = start + Duration::from_secs(10);
        assert_eq!(
            adaptor.poll(early),
            Decision::Wait {
                until: start + Duration::from_secs(15)
            }
        );

        let due = start + Duration::from_secs(15);
        assert_eq!(adaptor.poll(due), Decision::Reconnect);
        assert_eq!(adaptor.next_attempt_at(), Some(due + Duration::from_secs(30)));
        assert_eq!(adaptor.attempt_count(), 3);
    }

    #[test]
    fn test_constant_delay_keeps_retrying_within_budget() {
        let strategy = RetryStrategy::new(
            0,
            RetryDelay::Constant(Duration::from_secs(10)),
            Duration::from_secs(60),
        );
        let mut adaptor = ConnectivityAdaptorManager::new(strategy);
        let start = Instant::now();

        let mut now = start;
        let mut attempts = 0;
        loop {
            match adaptor.poll(now) {
                Decision::Reconnect => attempts += 1,
                Decision::Wait { until } => now = until,
                Decision::Throttle => break,
                Decision::ReconnectExhausted => unreachable!(),
            }
        }

        // Attempts at t=0, 10, ..., 60; the deadline itself is still in budget.
        assert_eq!(attempts, 7);
    }
}
