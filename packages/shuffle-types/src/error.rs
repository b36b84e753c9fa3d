//! Error taxonomy for the shuffle executor.
//!
//! Mirrors the kinds (not exception hierarchy) the spec distinguishes:
//! a lookup miss, an absorbing corruption state, a quota violation, and an
//! invariant violation that is a programming error rather than a user error.

use thiserror::Error;

use crate::ids::AppShuffleId;

/// Errors surfaced by `ShuffleExecutor` operations.
#[derive(Debug, Error)]
pub enum ShuffleError {
    /// Lookup for a shuffle stage that has never been registered.
    #[error("stage {0} not started")]
    StageNotStarted(AppShuffleId),

    /// The stage's `fileStatus` is `CORRUPTED`: a schema mismatch on
    /// re-registration, or an exception during write/flush/commit. This
    /// state is absorbing -- it is never cleared.
    #[error("stage {stage} is corrupted: {reason}")]
    StageCorrupted { stage: AppShuffleId, reason: String },

    /// Cumulative write bytes for the owning application exceeded
    /// `app_max_write_bytes`.
    #[error("application write quota exceeded for stage {0}")]
    QuotaExceeded(AppShuffleId),

    /// An invariant the caller is responsible for upholding was violated
    /// (e.g. `flushPartitions` invoked with attempts spanning more than one
    /// stage). This is a programming error, not a recoverable user error,
    /// and is never caught internally.
    #[error("invalid executor state: {0}")]
    InvalidState(String),

    /// Transient I/O failure. Callers on the write/flush/commit path treat
    /// this the same as `StageCorrupted`; it is kept distinct so the
    /// underlying cause is preserved for logging.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShuffleError {
    /// Whether this error, if encountered on the write/flush/commit path,
    /// should transition the owning stage to `CORRUPTED`.
    #[must_use]
    pub fn corrupts_stage(&self) -> bool {
        matches!(
            self,
            ShuffleError::StageCorrupted { .. } | ShuffleError::QuotaExceeded(_) | ShuffleError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AppId;

    fn stage() -> AppShuffleId {
        AppShuffleId::new(AppId::from("app-1"), 0)
    }

    #[test]
    fn quota_and_io_and_corruption_corrupt_the_stage() {
        assert!(ShuffleError::QuotaExceeded(stage()).corrupts_stage());
        assert!(ShuffleError::Io(std::io::Error::other("boom")).corrupts_stage());
        assert!(ShuffleError::StageCorrupted {
            stage: stage(),
            reason: "mismatch".into()
        }
        .corrupts_stage());
    }

    #[test]
    fn not_started_and_invalid_state_do_not_corrupt() {
        assert!(!ShuffleError::StageNotStarted(stage()).corrupts_stage());
        assert!(!ShuffleError::InvalidState("boom".into()).corrupts_stage());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = ShuffleError::StageNotStarted(stage());
        assert_eq!(err.to_string(), "stage app-1/shuffle-0 not started");
    }
}
