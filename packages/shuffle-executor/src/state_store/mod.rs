//! Append-only durable log of state items, with a commit/compaction barrier
//! and a replay iterator for startup recovery.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use shuffle_types::state_log::StateLogItem;

/// Durable log contract. The executor is the only writer -- there are no
/// concurrent writers to reason about -- but `append`/`commit`/`close` are
/// still async because real implementations do I/O.
///
/// Implementations may compact on `commit`; the only hard requirement is
/// append order is preserved across a `load_data` call following a prior
/// `commit`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Appends one log item. Does not guarantee durability on its own --
    /// call `commit` for that.
    async fn append(&self, item: StateLogItem) -> anyhow::Result<()>;

    /// Durability barrier. May also compact the log, dropping superseded
    /// records.
    async fn commit(&self) -> anyhow::Result<()>;

    /// Returns every item currently in the log, in append order. A one-shot
    /// read meant for startup recovery, not for streaming.
    async fn load_data(&self) -> anyhow::Result<Vec<StateLogItem>>;

    /// Releases any held resources (file handles, etc). Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}
