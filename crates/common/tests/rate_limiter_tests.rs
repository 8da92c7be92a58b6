//! Integration tests for the transfer interval limiter
//!
//! Tests the limiter the way the class driver uses it:
//! - check before an attempt, record after it
//! - waits computed against a shared manual clock
//! - reset when a device goes away

use common::{Clock, IntervalLimiter, ManualClock, RateLimitResult, SystemClock};
use std::time::Duration;

const INTERVAL: Duration = Duration::from_millis(8);

mod interval_limiter {
    use super::*;

    #[test]
    fn test_interval_is_reported() {
        let limiter = IntervalLimiter::new(INTERVAL);
        assert_eq!(limiter.interval(), INTERVAL);
    }

    #[test]
    fn test_attempt_sequence_against_manual_clock() {
        let clock = ManualClock::new();
        let mut limiter = IntervalLimiter::new(INTERVAL);

        assert!(limiter.check(clock.now()).is_allowed());
        limiter.record(clock.now());

        clock.advance(Duration::from_millis(2));
        assert_eq!(
            limiter.check(clock.now()),
            RateLimitResult::Wait(Duration::from_millis(6))
        );

        clock.advance(Duration::from_millis(6));
        assert!(limiter.check(clock.now()).is_allowed());
    }

    #[test]
    fn test_checking_does_not_consume() {
        let clock = ManualClock::new();
        let limiter = IntervalLimiter::new(INTERVAL);

        for _ in 0..10 {
            assert!(limiter.check(clock.now()).is_allowed());
        }
    }

    #[test]
    fn test_record_restarts_the_interval() {
        let clock = ManualClock::new();
        let mut limiter = IntervalLimiter::new(INTERVAL);
        limiter.record(clock.now());

        clock.advance(Duration::from_millis(20));
        limiter.record(clock.now());

        clock.advance(Duration::from_millis(1));
        assert_eq!(
            limiter.check(clock.now()).wait_duration(),
            Some(Duration::from_millis(7))
        );
    }

    #[test]
    fn test_reset_allows_immediate_attempt() {
        let clock = ManualClock::new();
        let mut limiter = IntervalLimiter::new(INTERVAL);
        limiter.record(clock.now());
        assert!(!limiter.check(clock.now()).is_allowed());

        limiter.reset();
        assert!(limiter.check(clock.now()).is_allowed());
    }

    #[test]
    fn test_zero_interval_never_waits() {
        let clock = ManualClock::new();
        let mut limiter = IntervalLimiter::new(Duration::ZERO);
        limiter.record(clock.now());
        assert!(limiter.check(clock.now()).is_allowed());
    }
}

mod rate_limit_result {
    use super::*;

    #[test]
    fn test_allowed_has_no_wait() {
        assert!(RateLimitResult::Allowed.is_allowed());
        assert_eq!(RateLimitResult::Allowed.wait_duration(), None);
    }

    #[test]
    fn test_wait_is_not_allowed() {
        let result = RateLimitResult::Wait(INTERVAL);
        assert!(!result.is_allowed());
        assert_eq!(result.wait_duration(), Some(INTERVAL));
    }
}

mod clocks {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(clock.now(), start);

        clock.advance(INTERVAL);
        assert_eq!(clock.now() - start, INTERVAL);
    }

    #[test]
    fn test_manual_clock_shared_across_threads() {
        let clock = ManualClock::new();
        let start = clock.now();

        let remote = clock.clone();
        std::thread::spawn(move || remote.advance(Duration::from_millis(5)))
            .join()
            .expect("Clock thread panicked");

        assert_eq!(clock.now() - start, Duration::from_millis(5));
    }
}
