//! Metrics sink abstraction.
//!
//! Counters/gauges are process-global in most deployments; modeling them as
//! a passed-in trait keeps the executor core unit-testable without a live
//! metrics exporter.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Observable counters and gauges the executor reports.
///
/// Implementations must be cheap to call from hot paths (write, flush) --
/// no I/O, no locking beyond what an atomic or a lock-free metrics registry
/// already does.
pub trait MetricsSink: Send + Sync {
    fn record_state_load_time_millis(&self, millis: u64);
    fn incr_state_load_warnings(&self);
    fn incr_state_load_errors(&self);
    fn incr_state_partial_loads(&self);
    fn set_num_live_applications(&self, count: u64);
    fn incr_num_expired_applications(&self);
    fn incr_num_truncated_applications(&self);
    fn record_map_attempt_flush_delay_millis(&self, millis: u64);
    fn record_map_attempt_flush_time_millis(&self, millis: u64);
}

/// Discards every observation. Used where no metrics backend is wired up
/// (e.g. unit tests that don't care about metrics).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_state_load_time_millis(&self, _millis: u64) {}
    fn incr_state_load_warnings(&self) {}
    fn incr_state_load_errors(&self) {}
    fn incr_state_partial_loads(&self) {}
    fn set_num_live_applications(&self, _count: u64) {}
    fn incr_num_expired_applications(&self) {}
    fn incr_num_truncated_applications(&self) {}
    fn record_map_attempt_flush_delay_millis(&self, _millis: u64) {}
    fn record_map_attempt_flush_time_millis(&self, _millis: u64) {}
}

/// Production sink backed by the `metrics` crate's global recorder. Pair
/// with a `metrics-exporter-prometheus` recorder installed at process
/// startup (out of scope for this crate -- that's bootstrap/CLI territory).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordingMetricsSink;

impl MetricsSink for RecordingMetricsSink {
    fn record_state_load_time_millis(&self, millis: u64) {
        metrics::histogram!("shuffle_state_load_time_ms").record(millis as f64);
    }

    fn incr_state_load_warnings(&self) {
        metrics::counter!("shuffle_state_load_warnings").increment(1);
    }

    fn incr_state_load_errors(&self) {
        metrics::counter!("shuffle_state_load_errors").increment(1);
    }

    fn incr_state_partial_loads(&self) {
        metrics::counter!("shuffle_state_partial_loads").increment(1);
    }

    fn set_num_live_applications(&self, count: u64) {
        metrics::gauge!("shuffle_num_live_applications").set(count as f64);
    }

    fn incr_num_expired_applications(&self) {
        metrics::counter!("shuffle_num_expired_applications").increment(1);
    }

    fn incr_num_truncated_applications(&self) {
        metrics::counter!("shuffle_num_truncated_applications").increment(1);
    }

    fn record_map_attempt_flush_delay_millis(&self, millis: u64) {
        metrics::histogram!("shuffle_map_attempt_flush_delay_ms").record(millis as f64);
    }

    fn record_map_attempt_flush_time_millis(&self, millis: u64) {
        metrics::histogram!("shuffle_map_attempt_flush_time_ms").record(millis as f64);
    }
}

/// In-memory sink that records every observation for test assertions.
#[derive(Debug, Default)]
pub struct RecordingTestSink {
    pub state_load_warnings: AtomicU64,
    pub state_load_errors: AtomicU64,
    pub state_partial_loads: AtomicU64,
    pub num_live_applications: AtomicI64,
    pub num_expired_applications: AtomicU64,
    pub num_truncated_applications: AtomicU64,
    pub last_state_load_time_millis: AtomicU64,
}

impl MetricsSink for RecordingTestSink {
    fn record_state_load_time_millis(&self, millis: u64) {
        self.last_state_load_time_millis.store(millis, Ordering::Relaxed);
    }

    fn incr_state_load_warnings(&self) {
        self.state_load_warnings.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_state_load_errors(&self) {
        self.state_load_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_state_partial_loads(&self) {
        self.state_partial_loads.fetch_add(1, Ordering::Relaxed);
    }

    fn set_num_live_applications(&self, count: u64) {
        self.num_live_applications.store(count as i64, Ordering::Relaxed);
    }

    fn incr_num_expired_applications(&self) {
        self.num_expired_applications.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_num_truncated_applications(&self) {
        self.num_truncated_applications.fetch_add(1, Ordering::Relaxed);
    }

    fn record_map_attempt_flush_delay_millis(&self, _millis: u64) {}
    fn record_map_attempt_flush_time_millis(&self, _millis: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_test_sink_tracks_counters() {
        let sink = RecordingTestSink::default();
        sink.incr_state_load_warnings();
        sink.incr_state_load_warnings();
        sink.incr_num_expired_applications();
        sink.set_num_live_applications(3);

        assert_eq!(sink.state_load_warnings.load(Ordering::Relaxed), 2);
        assert_eq!(sink.num_expired_applications.load(Ordering::Relaxed), 1);
        assert_eq!(sink.num_live_applications.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn noop_sink_never_panics() {
        let sink = NoopMetricsSink;
        sink.record_state_load_time_millis(10);
        sink.incr_state_load_warnings();
        sink.incr_state_load_errors();
        sink.incr_state_partial_loads();
        sink.set_num_live_applications(0);
        sink.incr_num_expired_applications();
        sink.incr_num_truncated_applications();
        sink.record_map_attempt_flush_delay_millis(1);
        sink.record_map_attempt_flush_time_millis(1);
    }
}
