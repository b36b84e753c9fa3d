//! In-memory `StateStore`, used by unit tests the way the teacher's
//! null/in-memory storage engines back factory-built test fixtures.

use async_trait::async_trait;
use parking_lot::Mutex;
use shuffle_types::state_log::StateLogItem;

use super::StateStore;

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    items: Mutex<Vec<StateLogItem>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn append(&self, item: StateLogItem) -> anyhow::Result<()> {
        self.items.lock().push(item);
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_data(&self) -> anyhow::Result<Vec<StateLogItem>> {
        Ok(self.items.lock().clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
