//! Append-only writer for one `(stage, partition)`'s byte stream.
//!
//! Buffered writes accumulate under a `parking_lot::Mutex`; the actual
//! `write_all`/`sync_data` syscalls run inside `spawn_blocking` so neither
//! the caller's async task nor the flush task blocks the reactor thread.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// One partition's append-mode file handle plus its pending write buffer.
///
/// Appends from one caller are serialized by the buffer mutex; `flush`
/// drains the buffer and is a synchronization point -- once it returns,
/// every `write_data` call that happened-before it is persisted.
pub struct PartitionWriter {
    inner: Arc<Mutex<Inner>>,
    persisted_length: Arc<AtomicU64>,
    fsync_enabled: bool,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

struct Inner {
    file: Option<File>,
    buffer: Vec<u8>,
}

impl PartitionWriter {
    #[must_use]
    pub fn new(file: File, fsync_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                file: Some(file),
                buffer: Vec::new(),
            })),
            persisted_length: Arc::new(AtomicU64::new(0)),
            fsync_enabled,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Appends `bytes` to the in-memory buffer. Ownership of `bytes`
    /// transfers in regardless of the outcome -- a write to a closed writer
    /// is a caller bug and returns an error, but the buffer passed in is
    /// still consumed (dropped), satisfying the release-exactly-once rule
    /// from the caller's point of view.
    pub fn write_data(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("write to closed partition writer");
        }
        let mut inner = self.inner.lock();
        inner.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    /// Pushes the buffered bytes to the OS, optionally `fsync`ing, and
    /// updates `persisted_length`. Returns only after the blocking task
    /// completes.
    pub async fn flush(&self) -> anyhow::Result<u64> {
        let inner = Arc::clone(&self.inner);
        let fsync_enabled = self.fsync_enabled;
        let written = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            let mut guard = inner.lock();
            let Inner { file, buffer } = &mut *guard;
            let Some(file) = file.as_mut() else {
                anyhow::bail!("flush on closed partition writer");
            };
            let len = buffer.len();
            if len > 0 {
                file.write_all(buffer)?;
            }
            if fsync_enabled {
                file.sync_data()?;
            }
            buffer.clear();
            Ok(len)
        })
        .await??;

        Ok(self
            .persisted_length
            .fetch_add(written as u64, Ordering::AcqRel)
            + written as u64)
    }

    /// Flushes remaining bytes then releases the file handle. Idempotent --
    /// a second call is a no-op.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush().await?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.lock().file.take();
        })
        .await?;
        Ok(())
    }

    /// Total bytes that have passed at least one `flush`. Monotonic
    /// non-decreasing.
    #[must_use]
    pub fn persisted_length(&self) -> u64 {
        self.persisted_length.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
