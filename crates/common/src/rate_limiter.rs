//! Minimum-interval rate limiting for transfer attempts
//!
//! The class driver retries control and interrupt transfers from its
//! dispatch loop. Without a gate those retries would hit the device at loop
//! speed, so every transfer stage owns an [`IntervalLimiter`] and only
//! issues an attempt once the configured interval has elapsed since the
//! previous one.
//!
//! The limiter never sleeps. It reports how long the caller would have to
//! wait so the dispatch loop can pump host events for that long instead of
//! spinning.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of the current time for rate limiting
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to, for tests
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rate limiting result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Attempt is allowed to proceed
    Allowed,
    /// Attempt should be deferred for the specified duration
    Wait(Duration),
}

impl RateLimitResult {
    /// Returns true if the attempt is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Get the wait duration, if any
    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::Wait(d) => Some(*d),
        }
    }
}

/// Gate that admits at most one attempt per `interval`
#[derive(Debug, Clone)]
pub struct IntervalLimiter {
    interval: Duration,
    last_attempt: Option<Instant>,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_attempt: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check whether an attempt at `now` is allowed
    ///
    /// The first attempt is always allowed. Afterwards at least `interval`
    /// must have elapsed since the last recorded attempt.
    pub fn check(&self, now: Instant) -> RateLimitResult {
        match self.last_attempt {
            None => RateLimitResult::Allowed,
            Some(last) => {
                let elapsed = now.saturating_duration_since(last);
                if elapsed >= self.interval {
                    RateLimitResult::Allowed
                } else {
                    RateLimitResult::Wait(self.interval - elapsed)
                }
            }
        }
    }

    /// Record that an attempt finished at `now`
    pub fn record(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Forget the previous attempt (used when a device goes away)
    pub fn reset(&mut self) {
        self.last_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_allowed() {
        let limiter = IntervalLimiter::new(Duration::from_millis(8));
        assert!(limiter.check(Instant::now()).is_allowed());
    }

    #[test]
    fn test_attempt_within_interval_deferred() {
        let mut limiter = IntervalLimiter::new(Duration::from_millis(8));
        let start = Instant::now();
        limiter.record(start);

        let result = limiter.check(start + Duration::from_millis(3));
        assert_eq!(result, RateLimitResult::Wait(Duration::from_millis(5)));
        assert_eq!(result.wait_duration(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_attempt_after_interval_allowed() {
        let mut limiter = IntervalLimiter::new(Duration::from_millis(8));
        let start = Instant::now();
        limiter.record(start);

        assert!(limiter.check(start + Duration::from_millis(8)).is_allowed());
        assert!(limiter.check(start + Duration::from_millis(20)).is_allowed());
    }

    #[test]
    fn test_clock_going_backwards_is_deferred() {
        let mut limiter = IntervalLimiter::new(Duration::from_millis(8));
        let start = Instant::now() + Duration::from_secs(1);
        limiter.record(start);

        let result = limiter.check(start - Duration::from_millis(1));
        assert_eq!(result, RateLimitResult::Wait(Duration::from_millis(8)));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();
        other.advance(Duration::from_millis(10));
        assert_eq!(clock.now() - start, Duration::from_millis(10));
    }

    #[test]
    fn test_reset() {
        let mut limiter = IntervalLimiter::new(Duration::from_millis(8));
        let start = Instant::now();
        limiter.record(start);
        limiter.reset();
        assert!(limiter.check(start).is_allowed());
    }
}
