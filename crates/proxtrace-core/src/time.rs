//! Epoch to day/interval arithmetic.
//!
//! The protocol counts time in 10-minute intervals since the Unix epoch. A day is
//! exactly [`INTERVALS_PER_DAY`] intervals; day boundaries are UTC midnights.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Number of 10-minute intervals in one day.
pub const INTERVALS_PER_DAY: i64 = 144;

/// Seconds in one interval.
pub const SECONDS_PER_INTERVAL: i64 = 600;

/// Seconds in one day.
pub const SECONDS_PER_DAY: i64 = 86_400;

/// Milliseconds in one day.
pub const MILLIS_PER_DAY: i64 = SECONDS_PER_DAY * 1000;

/// Seconds in one minute.
pub const SECONDS_PER_MINUTE: i64 = 60;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Create a clock frozen at the given number of seconds since the epoch.
    #[must_use]
    pub fn at_epoch_seconds(seconds: i64) -> Self {
        Self::new(Utc.timestamp_opt(seconds, 0).single().unwrap_or_default())
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Advance the clock by `seconds`.
    pub fn advance_seconds(&self, seconds: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Interval and day arithmetic over a shared [`Clock`].
#[derive(Clone)]
pub struct TimeBase {
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBase")
            .field("now", &self.clock.now())
            .finish()
    }
}

impl TimeBase {
    /// Wrap a clock.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// A time base on the system clock.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Seconds since the Unix epoch.
    #[must_use]
    pub fn seconds_since_epoch(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Current interval number.
    #[must_use]
    pub fn interval_number(&self) -> i64 {
        self.seconds_since_epoch().div_euclid(SECONDS_PER_INTERVAL)
    }

    /// Current day number.
    #[must_use]
    pub fn day_number(&self) -> i64 {
        self.seconds_since_epoch().div_euclid(SECONDS_PER_DAY)
    }

    /// Interval number at which data older than `days` days must be dropped.
    #[must_use]
    pub fn retention_cutoff(&self, days: i64) -> i64 {
        day_start_interval(self.day_number() - days)
    }
}

/// Day number containing `interval`.
#[must_use]
pub const fn interval_to_day(interval: i64) -> i64 {
    interval.div_euclid(INTERVALS_PER_DAY)
}

/// First interval of `day`.
#[must_use]
pub const fn day_start_interval(day: i64) -> i64 {
    day * INTERVALS_PER_DAY
}

/// Midnight (UTC, milliseconds since the epoch) of the day containing `interval`.
#[must_use]
pub const fn interval_to_day_millis(interval: i64) -> i64 {
    interval_to_day(interval) * MILLIS_PER_DAY
}

/// Whether two intervals fall on the same day.
#[must_use]
pub const fn same_day(a: i64, b: i64) -> bool {
    interval_to_day(a) == interval_to_day(b)
}

/// Encode an interval number as an unsigned 32-bit little-endian value.
///
/// Only the low 32 bits are kept.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub const fn encode_interval(interval: i64) -> [u8; 4] {
    (interval as u32).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_at(seconds: i64) -> TimeBase {
        TimeBase::new(Arc::new(ManualClock::at_epoch_seconds(seconds)))
    }

    #[test]
    fn test_interval_and_day_numbers() {
        // 2020-06-01T00:00:00Z
        let time = base_at(1_590_969_600);
        assert_eq!(time.day_number(), 18_414);
        assert_eq!(time.interval_number(), 18_414 * 144);
    }

    #[test]
    fn test_interval_granularity() {
        let time = base_at(599);
        assert_eq!(time.interval_number(), 0);
        let time = base_at(600);
        assert_eq!(time.interval_number(), 1);
    }

    #[test]
    fn test_day_helpers() {
        assert_eq!(interval_to_day(143), 0);
        assert_eq!(interval_to_day(144), 1);
        assert_eq!(day_start_interval(3), 432);
        assert_eq!(interval_to_day_millis(145), MILLIS_PER_DAY);
        assert!(same_day(144, 287));
        assert!(!same_day(143, 144));
    }

    #[test]
    fn test_retention_cutoff_is_day_aligned() {
        let time = base_at(20 * SECONDS_PER_DAY + 3_000);
        assert_eq!(time.retention_cutoff(14), 6 * 144);
    }

    #[test]
    fn test_encode_interval_little_endian() {
        assert_eq!(encode_interval(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
        assert_eq!(encode_interval(0x1_0000_0001), [0x01, 0, 0, 0]);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = Arc::new(ManualClock::at_epoch_seconds(0));
        let time = TimeBase::new(clock.clone());
        clock.advance_seconds(SECONDS_PER_DAY);
        assert_eq!(time.day_number(), 1);
    }
}
