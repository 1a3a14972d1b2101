//! Monotonic and wall-clock time. Grounded in
//! `original_source/include/TimeStamp.h`: a signed microsecond count since
//! the epoch, 0 meaning invalid, with free-function-style arithmetic kept
//! as inherent methods in the idiomatic-Rust rewrite.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

/// Microseconds since the Unix epoch. `Timestamp(0)` is the invalid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn invalid() -> Timestamp {
        Timestamp(0)
    }

    pub fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Wall-clock "now" via `SystemTime`. `EventLoop`/`TimerQueue` use the
    /// `Clock` capability instead so callers can substitute a fake clock in
    /// tests; this is the default `Clock` implementation's backing call.
    pub fn now() -> Timestamp {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(dur.as_micros() as i64)
    }

    /// `addTime(ts, seconds)`.
    pub fn add_seconds(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROSECONDS_PER_SECOND as f64) as i64;
        Timestamp(self.0 + delta)
    }

    /// `difference(hi, lo) -> f64 seconds`.
    pub fn difference(hi: Timestamp, lo: Timestamp) -> f64 {
        let diff = hi.0 - lo.0;
        diff as f64 / MICROSECONDS_PER_SECOND as f64
    }

    /// Grounded in `TimeStamp.h`'s `toFormattedString`.
    pub fn to_formatted_string(&self, show_microseconds: bool) -> String {
        let seconds = self.0 / MICROSECONDS_PER_SECOND;
        let micros = self.0 % MICROSECONDS_PER_SECOND;

        if show_microseconds {
            format!("{}.{:06}", seconds, micros)
        } else {
            format!("{}", seconds)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_formatted_string(true))
    }
}

/// A capability returning monotonic microseconds, so tests can substitute
/// a deterministic source without touching the reactor internals.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_zero() {
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn add_and_difference_roundtrip() {
        let t0 = Timestamp::from_micros(1_000_000);
        let t1 = t0.add_seconds(2.5);
        assert_eq!(t1.micros_since_epoch(), 3_500_000);
        assert!((Timestamp::difference(t1, t0) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn ordering_is_numeric() {
        let a = Timestamp::from_micros(5);
        let b = Timestamp::from_micros(10);
        assert!(a < b);
    }
}
