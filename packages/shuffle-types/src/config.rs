//! Configuration for the shuffle executor and its write path.

use serde::{Deserialize, Serialize};

/// Per-stage write configuration, supplied by the mapper on
/// `registerShuffle` and immutable for the lifetime of the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Number of file splits per partition. Drives how far `fileStartIndex`
    /// advances across a restart so the next run never reuses a suffix a
    /// prior run may still be holding open.
    pub num_splits: u32,
    /// Compression codec tag, passed through verbatim to partition writers.
    /// The executor never interprets this string.
    pub compression_codec: String,
    /// In-memory buffer threshold, in bytes, before a `PartitionWriter`
    /// flushes proactively. Not load-bearing for correctness -- purely a
    /// performance knob.
    pub max_buffer_bytes: usize,
}

impl WriteConfig {
    #[must_use]
    pub fn new(num_splits: u32, compression_codec: impl Into<String>) -> Self {
        Self {
            num_splits,
            compression_codec: compression_codec.into(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

const DEFAULT_MAX_BUFFER_BYTES: usize = 256 * 1024;

/// Top-level configuration for a `ShuffleExecutor` instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Filesystem base path under which per-application directories live.
    pub root_dir: std::path::PathBuf,
    /// Whether `PartitionWriter::flush` performs a durable `fsync`.
    pub fsync_enabled: bool,
    /// Inactivity window after which an application's state is expired.
    pub app_retention_millis: u64,
    /// Retention window for on-disk application directories, consulted by
    /// an external file-retention GC collaborator. Not enforced by this
    /// executor; only `app_retention_millis` drives `removeExpiredApplications`.
    pub app_file_retention_millis: u64,
    /// Per-application cumulative write-byte quota.
    pub app_max_write_bytes: u64,
    /// Minimum interval between `StateStore::commit()` calls triggered by
    /// flush completion. `0` commits on every flush.
    pub state_commit_interval_millis: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            root_dir: std::path::PathBuf::from("."),
            fsync_enabled: true,
            app_retention_millis: 6 * 60 * 60 * 1000,
            app_file_retention_millis: 36 * 60 * 60 * 1000,
            app_max_write_bytes: 3 * 1024 * 1024 * 1024 * 1024,
            state_commit_interval_millis: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_config_defaults_match_spec() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.app_retention_millis, 6 * 60 * 60 * 1000);
        assert_eq!(cfg.app_file_retention_millis, 36 * 60 * 60 * 1000);
        assert_eq!(cfg.app_max_write_bytes, 3 * 1024 * 1024 * 1024 * 1024);
        assert_eq!(cfg.state_commit_interval_millis, 0);
        assert!(cfg.fsync_enabled);
    }

    #[test]
    fn write_config_new_applies_default_buffer() {
        let wc = WriteConfig::new(4, "zstd");
        assert_eq!(wc.num_splits, 4);
        assert_eq!(wc.compression_codec, "zstd");
        assert_eq!(wc.max_buffer_bytes, DEFAULT_MAX_BUFFER_BYTES);
    }
}
