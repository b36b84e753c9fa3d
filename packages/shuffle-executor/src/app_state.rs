//! Per-application liveness and write-byte accounting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use shuffle_types::ids::AppId;
use shuffle_types::time::Clock;

/// Liveness timestamp and cumulative write-byte counter for one application.
///
/// Created lazily on first touch; destroyed by `ShuffleExecutor`'s expiry
/// pass once `now - liveness > app_retention_millis`.
pub struct AppState {
    app_id: AppId,
    liveness_millis: AtomicI64,
    num_write_bytes: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(app_id: AppId, clock: &dyn Clock) -> Self {
        Self {
            app_id,
            liveness_millis: AtomicI64::new(clock.now_millis()),
            num_write_bytes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn touch(&self, clock: &dyn Clock) {
        self.liveness_millis.store(clock.now_millis(), Ordering::Release);
    }

    #[must_use]
    pub fn liveness_millis(&self) -> i64 {
        self.liveness_millis.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_expired(&self, now_millis: i64, app_retention_millis: u64) -> bool {
        now_millis - self.liveness_millis() > app_retention_millis as i64
    }

    /// Adds `bytes` to the cumulative write counter and returns the new
    /// total, for the caller to compare against the quota.
    pub fn add_write_bytes(&self, bytes: u64) -> u64 {
        self.num_write_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    #[must_use]
    pub fn num_write_bytes(&self) -> u64 {
        self.num_write_bytes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use shuffle_types::time::TestClock;

    use super::*;

    #[test]
    fn touch_updates_liveness() {
        let clock = TestClock::new(100);
        let app = AppState::new(AppId::from("app-1"), &clock);
        assert_eq!(app.liveness_millis(), 100);

        clock.set(500);
        app.touch(&clock);
        assert_eq!(app.liveness_millis(), 500);
    }

    #[test]
    fn expiry_compares_against_retention_window() {
        let clock = TestClock::new(0);
        let app = AppState::new(AppId::from("app-1"), &clock);
        assert!(!app.is_expired(1000, 2000));
        assert!(app.is_expired(2001, 2000));
    }

    #[test]
    fn write_bytes_accumulate_monotonically() {
        let clock = TestClock::new(0);
        let app = AppState::new(AppId::from("app-1"), &clock);
        assert_eq!(app.add_write_bytes(10), 10);
        assert_eq!(app.add_write_bytes(5), 15);
        assert_eq!(app.num_write_bytes(), 15);
    }
}
