//! Injectable time source.
//!
//! Components read "now" through a [`Clock`] so that delay windows and
//! backoff can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a fractional hour count into a chrono duration (millisecond precision).
///
/// Negative and NaN inputs count as zero; anything past the chrono range
/// saturates at `Duration::MAX`.
pub fn hours(h: f64) -> Duration {
    if h.is_nan() || h <= 0.0 {
        return Duration::zero();
    }
    // `as` saturates at i64::MAX
    let ms = (h * 3_600_000.0).round() as i64;
    Duration::try_milliseconds(ms).unwrap_or(Duration::MAX)
}
