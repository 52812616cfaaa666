//! Clock abstraction and delay arithmetic.
//!
//! Every deadline in the crate (delayed release, reservation expiry, limiter
//! leases) is an absolute Unix timestamp in seconds computed from a [`Clock`].
//! Production code uses [`SystemClock`]; tests drive a [`ManualClock`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of the current Unix time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Settable clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward (or backward, for negative values)
    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> i64 {
        (**self).now()
    }
}

/// A relative or absolute point in time at which a job becomes available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Seconds from now; negative values mean "already due"
    Seconds(i64),
    /// An absolute instant
    At(DateTime<Utc>),
    /// A duration from now
    Interval(chrono::Duration),
}

impl Delay {
    pub fn none() -> Self {
        Self::Seconds(0)
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::none()
    }
}

impl From<i64> for Delay {
    fn from(seconds: i64) -> Self {
        Self::Seconds(seconds)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }
}

impl From<chrono::Duration> for Delay {
    fn from(interval: chrono::Duration) -> Self {
        Self::Interval(interval)
    }
}

impl From<std::time::Duration> for Delay {
    fn from(duration: std::time::Duration) -> Self {
        Self::Seconds(i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
    }
}

/// Unix timestamp at which something delayed by `delay` becomes available
pub fn available_at(clock: &dyn Clock, delay: Delay) -> i64 {
    match delay {
        Delay::Seconds(seconds) => clock.now().saturating_add(seconds),
        Delay::At(at) => at.timestamp(),
        Delay::Interval(interval) => clock.now().saturating_add(interval.num_seconds()),
    }
}

/// Number of seconds until `delay` is reached.
///
/// Absolute instants in the past clamp to zero; relative seconds are returned
/// as given, negative values included.
pub fn seconds_until(clock: &dyn Clock, delay: Delay) -> i64 {
    match delay {
        Delay::Seconds(seconds) => seconds,
        Delay::At(at) => (at.timestamp() - clock.now()).max(0),
        Delay::Interval(interval) => interval.num_seconds(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_available_at_relative_and_absolute() {
        let clock = ManualClock::new(1_000);

        assert_eq!(available_at(&clock, Delay::Seconds(60)), 1_060);
        assert_eq!(available_at(&clock, Delay::Seconds(-5)), 995);
        assert_eq!(available_at(&clock, chrono::Duration::minutes(2).into()), 1_120);

        let at = Utc.timestamp_opt(5_000, 0).unwrap();
        assert_eq!(available_at(&clock, at.into()), 5_000);
    }

    #[test]
    fn test_seconds_until_clamps_absolute_only() {
        let clock = ManualClock::new(1_000);
        let past = Utc.timestamp_opt(900, 0).unwrap();
        let future = Utc.timestamp_opt(1_030, 0).unwrap();

        assert_eq!(seconds_until(&clock, past.into()), 0);
        assert_eq!(seconds_until(&clock, future.into()), 30);
        assert_eq!(seconds_until(&clock, Delay::Seconds(-3)), -3);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now(), 15);
        clock.set(2);
        assert_eq!(clock.now(), 2);
    }
}
