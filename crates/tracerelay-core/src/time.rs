//! Time abstractions for testable scheduling.
//!
//! Every timestamp the engine writes (`last_attempt_at`, `next_retry_at`,
//! rate-limit windows, expiry cutoffs) comes from a `Clock`, so tests can
//! drive retries and expiry without waiting on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock backed by the system clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clock handed to the engine
/// can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since creation.
    monotonic_ns: Arc<AtomicU64>,
    /// Wall-clock time as microseconds since the UNIX epoch.
    wall_us: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            wall_us: Arc::new(AtomicI64::new(start.timestamp_micros())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let us = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);

        self.monotonic_ns.fetch_add(ns, Ordering::AcqRel);
        self.wall_us.fetch_add(us, Ordering::AcqRel);
    }

    /// Jumps the wall clock to a specific time.
    ///
    /// Moving forward also advances monotonic time; moving backward only
    /// affects the wall clock.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        let target = time.timestamp_micros();
        let current = self.wall_us.load(Ordering::Acquire);

        if target > current {
            let diff = u64::try_from(target - current).unwrap_or(0);
            self.advance(Duration::from_micros(diff));
        } else {
            self.wall_us.store(target, Ordering::Release);
        }
    }

    /// Returns elapsed monotonic time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let us = self.wall_us.load(Ordering::Acquire);
        Utc.timestamp_micros(us).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // sleeping advances virtual time and yields
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_both_timelines() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);
        let instant = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(instant), Duration::from_secs(10));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(10));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let handle = clock.clone();
        let before = clock.now_utc();

        handle.advance(Duration::from_secs(60));

        assert_eq!(clock.now_utc() - before, chrono::Duration::seconds(60));
    }

    #[test]
    fn jump_backwards_only_moves_wall_clock() {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);
        let earlier = start - chrono::Duration::hours(1);

        clock.jump_to(earlier);

        assert_eq!(clock.now_utc(), earlier);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let before = clock.now_utc();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now_utc() - before, chrono::Duration::seconds(5));
    }
}
