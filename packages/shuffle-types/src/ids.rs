//! Identifiers shared across the shuffle executor.
//!
//! All identifiers here are value types: totally ordered, hashable, and
//! cheap to clone. They compose the way the protocol nests them -- an
//! `AppShuffleId` names one shuffle stage, an `AppMapId` one mapper within
//! that stage, and an `AppTaskAttemptId` one attempt of that mapper.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque application identifier, assigned by the cluster manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(pub String);

impl AppId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AppId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies one shuffle stage: all map outputs of `(app, shuffleId)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppShuffleId {
    pub app_id: AppId,
    pub shuffle_id: i32,
}

impl AppShuffleId {
    #[must_use]
    pub fn new(app_id: AppId, shuffle_id: i32) -> Self {
        Self { app_id, shuffle_id }
    }
}

impl fmt::Display for AppShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/shuffle-{}", self.app_id, self.shuffle_id)
    }
}

/// Identifies one mapper within a shuffle stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppMapId {
    pub app_shuffle_id: AppShuffleId,
    pub map_id: i32,
}

impl AppMapId {
    #[must_use]
    pub fn new(app_shuffle_id: AppShuffleId, map_id: i32) -> Self {
        Self {
            app_shuffle_id,
            map_id,
        }
    }
}

/// Identifies one attempt of one mapper.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppTaskAttemptId {
    pub app_map_id: AppMapId,
    pub task_attempt_id: i64,
}

impl AppTaskAttemptId {
    #[must_use]
    pub fn new(app_map_id: AppMapId, task_attempt_id: i64) -> Self {
        Self {
            app_map_id,
            task_attempt_id,
        }
    }

    #[must_use]
    pub fn app_shuffle_id(&self) -> &AppShuffleId {
        &self.app_map_id.app_shuffle_id
    }

    #[must_use]
    pub fn map_id(&self) -> i32 {
        self.app_map_id.map_id
    }

    /// Strips the app/shuffle context, leaving the stage-local identity.
    #[must_use]
    pub fn map_task_attempt_id(&self) -> MapTaskAttemptId {
        MapTaskAttemptId {
            map_id: self.app_map_id.map_id,
            task_attempt_id: self.task_attempt_id,
        }
    }
}

/// Identifies one partition within a shuffle stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppShufflePartitionId {
    pub app_shuffle_id: AppShuffleId,
    pub partition_id: i32,
}

impl AppShufflePartitionId {
    #[must_use]
    pub fn new(app_shuffle_id: AppShuffleId, partition_id: i32) -> Self {
        Self {
            app_shuffle_id,
            partition_id,
        }
    }
}

/// Stage-local map attempt identity, used once the `AppShuffleId` context is
/// already fixed (e.g. inside `StageState`, or in a `TaskAttemptCommit` log
/// record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapTaskAttemptId {
    pub map_id: i32,
    pub task_attempt_id: i64,
}

impl MapTaskAttemptId {
    #[must_use]
    pub fn new(map_id: i32, task_attempt_id: i64) -> Self {
        Self {
            map_id,
            task_attempt_id,
        }
    }
}
