//! Millisecond time source for breaker cooldowns.
//!
//! The breaker only ever compares "now" against a retry deadline it computed
//! earlier from the same clock, so readings need to be monotonic but not tied
//! to wall time. Tests inject a hand-advanced clock instead.

use std::time::{Duration, Instant};

/// Milliseconds elapsed since an arbitrary, fixed origin.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    /// Time left until `deadline_millis`, or `None` once it has been reached.
    fn until(&self, deadline_millis: u64) -> Option<Duration> {
        match deadline_millis.checked_sub(self.now_millis()) {
            Some(0) | None => None,
            Some(left) => Some(Duration::from_millis(left)),
        }
    }
}

/// Process-local clock whose origin is the moment it was created.
///
/// Breaker state never outlives the process, so no wall-clock anchor is kept.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(u64);

    impl Clock for Fixed {
        fn now_millis(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn monotonic_clock_starts_near_zero_and_advances() {
        let clock = MonotonicClock::default();
        let a = clock.now_millis();
        assert!(a < 1_000);
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_millis();
        assert!(b >= a + 4, "expected at least 4ms to elapse, got {a} -> {b}");
    }

    #[test]
    fn until_reports_time_left_before_a_deadline() {
        let clock = Fixed(1_000);
        assert_eq!(clock.until(1_250), Some(Duration::from_millis(250)));
        assert_eq!(clock.until(1_000), None);
        assert_eq!(clock.until(0), None);
    }
}
