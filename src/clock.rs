//! Clock — monotonic + wall-clock source, injectable for tests.
//!
//! The coordinator never calls `chrono::Utc::now()` or `Instant::now()`
//! directly; every time-dependent decision (backoff deadlines, health cache
//! TTL, drift checks) goes through a `Clock` so tests can drive time
//! deterministically.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Wall-clock + monotonic time source.
pub trait Clock: Send + Sync {
    /// Current UTC wall-clock time, used for timestamps persisted to the store.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for deadlines and TTLs that must not
    /// jump backward on wall-clock adjustment (NTP sync, DST, manual change).
    fn monotonic_now(&self) -> Instant;
}

/// Real clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Returns `true` if `timestamp` is further than `max_drift` in the future
/// relative to `clock`'s current wall-clock time (I5).
pub fn exceeds_future_drift(clock: &dyn Clock, timestamp: DateTime<Utc>, max_drift: Duration) -> bool {
    let now = clock.now_utc();
    match (timestamp - now).to_std() {
        Ok(ahead) => ahead > max_drift,
        Err(_) => false, // timestamp is not in the future at all
    }
}
