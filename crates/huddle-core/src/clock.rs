//! Monotonic wall clock for persisted timestamps.
//!
//! Timestamps are stored as unix microseconds. Within one process every call
//! to [`now`] returns a value strictly greater than the previous one, even if
//! the system clock stalls or steps backwards.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Last timestamp handed out, in unix microseconds.
static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Current time, strictly increasing across calls.
#[must_use]
pub fn now() -> DateTime<Utc> {
    from_micros(now_micros())
}

/// Current time in unix microseconds, strictly increasing across calls.
#[must_use]
pub fn now_micros() -> i64 {
    let wall = Utc::now().timestamp_micros();
    let mut prev = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = wall.max(prev + 1);
        match LAST_MICROS.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Convert stored microseconds back to a timestamp.
#[must_use]
pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Convert a timestamp to stored microseconds.
#[must_use]
pub fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}
