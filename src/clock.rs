//! Wall Clock Abstraction
//!
//! Every time-based decision (reminder buckets, auto-release thresholds,
//! lock deadlines) reads the clock through this handle so tests can pin
//! "now" and step it forward deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MIN: i64 = 60_000;
pub const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Millisecond-resolution clock handle.
///
/// `Clock::system()` reads real wall time; `Clock::fixed(..)` starts from a
/// chosen instant and only moves when a test advances it.
#[derive(Clone)]
pub struct Clock {
    source: ClockSource,
}

#[derive(Clone)]
enum ClockSource {
    System,
    Fixed(Arc<AtomicI64>),
}

impl Clock {
    pub fn system() -> Self {
        Self {
            source: ClockSource::System,
        }
    }

    /// Fixed clock for tests, starting at `start_ms` (epoch millis).
    pub fn fixed(start_ms: i64) -> Self {
        Self {
            source: ClockSource::Fixed(Arc::new(AtomicI64::new(start_ms))),
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> i64 {
        match &self.source {
            ClockSource::System => chrono::Utc::now().timestamp_millis(),
            ClockSource::Fixed(ms) => ms.load(Ordering::SeqCst),
        }
    }

    /// Current time in epoch seconds.
    pub fn now_secs(&self) -> i64 {
        self.now_ms() / MILLIS_PER_SEC
    }

    /// RFC3339 rendering of "now" for response payloads.
    pub fn now_rfc3339(&self) -> String {
        use chrono::TimeZone;
        let ms = self.now_ms();
        chrono::Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| ms.to_string())
    }

    /// Advance a fixed clock. Panics on a system clock; only tests call this.
    pub fn advance_ms(&self, delta_ms: i64) {
        match &self.source {
            ClockSource::System => panic!("advance_ms called on system clock"),
            ClockSource::Fixed(ms) => {
                debug_assert!(delta_ms >= 0, "clock cannot go backward");
                ms.fetch_add(delta_ms, Ordering::SeqCst);
            }
        }
    }

    /// Jump a fixed clock to an absolute instant. Panics on a system clock.
    pub fn set_ms(&self, now_ms: i64) {
        match &self.source {
            ClockSource::System => panic!("set_ms called on system clock"),
            ClockSource::Fixed(ms) => ms.store(now_ms, Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            ClockSource::System => write!(f, "Clock(system)"),
            ClockSource::Fixed(ms) => write!(f, "Clock(fixed @ {})", ms.load(Ordering::SeqCst)),
        }
    }
}
