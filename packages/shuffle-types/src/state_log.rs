//! Tagged state-store log items.
//!
//! Modeled as a sum type per the design notes: the recovery loader
//! pattern-matches on the variant, no reflection required.

use serde::{Deserialize, Serialize};

use crate::config::WriteConfig;
use crate::ids::{AppId, AppShuffleId, MapTaskAttemptId};

/// Whether a stage's outputs are still usable.
///
/// `Corrupted` is absorbing: once a stage transitions there, no operation
/// clears it back to `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Ok,
    Corrupted,
}

impl FileStatus {
    #[must_use]
    pub fn is_corrupted(self) -> bool {
        matches!(self, FileStatus::Corrupted)
    }
}

/// A finalized partition file as of some commit: the opaque path the
/// storage layer wrote to, and the total length persisted so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedFile {
    pub partition_id: i32,
    pub path: String,
    pub length: u64,
}

/// One record in the append-only state-store log.
///
/// Order-preserving: the recovery protocol in `shuffle-executor::recovery`
/// depends on replaying these in the order they were appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateLogItem {
    /// First registration (or a recovery-time re-persist with bumped
    /// `file_start_index`) of a shuffle stage.
    StageInfo {
        app_shuffle_id: AppShuffleId,
        num_maps: i32,
        num_partitions: i32,
        file_start_index: i32,
        write_config: WriteConfig,
        file_status: FileStatus,
    },
    /// A durable record that a set of map attempts flushed successfully,
    /// carrying the post-flush snapshot of every partition's finalized
    /// files.
    TaskAttemptCommit {
        app_shuffle_id: AppShuffleId,
        attempts: Vec<MapTaskAttemptId>,
        finalized_files: Vec<FinalizedFile>,
    },
    /// A stage was marked corrupted.
    StageCorruption { app_shuffle_id: AppShuffleId },
    /// An application's state and directory were removed on expiry.
    AppDeletion { app_id: AppId },
}

impl StateLogItem {
    /// The `AppShuffleId` this item concerns, if any. `AppDeletion` spans
    /// an entire application and has none.
    #[must_use]
    pub fn app_shuffle_id(&self) -> Option<&AppShuffleId> {
        match self {
            StateLogItem::StageInfo { app_shuffle_id, .. }
            | StateLogItem::TaskAttemptCommit { app_shuffle_id, .. }
            | StateLogItem::StageCorruption { app_shuffle_id } => Some(app_shuffle_id),
            StateLogItem::AppDeletion { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_corrupted_is_absorbing_by_construction() {
        assert!(FileStatus::Corrupted.is_corrupted());
        assert!(!FileStatus::Ok.is_corrupted());
    }

    #[test]
    fn app_shuffle_id_projection() {
        let id = AppShuffleId::new(AppId::from("a"), 1);
        let item = StateLogItem::StageCorruption {
            app_shuffle_id: id.clone(),
        };
        assert_eq!(item.app_shuffle_id(), Some(&id));

        let deletion = StateLogItem::AppDeletion {
            app_id: AppId::from("a"),
        };
        assert_eq!(deletion.app_shuffle_id(), None);
    }

    #[test]
    fn finalized_files_compare_by_value() {
        let a = FinalizedFile {
            partition_id: 0,
            path: "p0".into(),
            length: 10,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
