//! Clock abstraction for dependency injection.
//!
//! Mirrors the teacher's `ClockSource`/`SystemClock` pair: production code
//! reads real wall-clock time, tests inject a settable clock so liveness
//! and expiry windows are deterministic.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-enough wall-clock source, in milliseconds since the Unix
/// epoch. "Monotonic" here means non-decreasing from the executor's point
/// of view, not immune to NTP adjustment -- liveness timestamps only need
/// to compare, never to measure elapsed wall time precisely.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Default clock, reading `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as i64
    }
}

/// Settable clock for deterministic tests of liveness/expiry windows.
#[derive(Debug, Clone)]
pub struct TestClock {
    millis: Arc<AtomicI64>,
}

impl TestClock {
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: i64) {
        self.millis.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
