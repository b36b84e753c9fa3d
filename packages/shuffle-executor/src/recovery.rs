//! Startup recovery: replays the durable log into fresh `AppState`/
//! `StageState` instances before the executor serves any request.
//!
//! Bounded by a wall-clock budget, not the injected [`shuffle_types::time::Clock`]
//! -- this is a process-startup technical constraint, not a piece of
//! business state, so it reads real time directly.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use shuffle_types::ids::{AppId, AppShuffleId};
#[cfg(test)]
use shuffle_types::state_log::FileStatus;
use shuffle_types::state_log::StateLogItem;

use crate::app_state::AppState;
use crate::executor::ShuffleExecutor;
use crate::stage_state::StageState;

pub const RECOVERY_BUDGET: Duration = Duration::from_secs(30);

/// Outcome of one `load_state_store` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// `true` if the replay loop hit the time budget before the log was
    /// fully consumed. The executor still starts -- whatever state was
    /// replayed becomes authoritative, and the unreplayed tail is lost.
    pub partial: bool,
    pub corrupted_stages: usize,
    pub deleted_apps: usize,
    pub recovered_apps: usize,
}

/// Replays every item in `executor.state_store`, in log order, into
/// `executor.stage_states`/`executor.app_states`.
///
/// Processing order per item:
/// - `StageInfo`: creates the stage if absent and installs its shape, or
///   verifies an identical shape against an already-recreated stage
///   (the log may contain more than one `StageInfo` for the same stage
///   if it was re-persisted after a recovery-time `file_start_index`
///   bump). `file_start_index` is bumped by `write_config.num_splits` so
///   the next run never reuses a file suffix a crashed run may still hold
///   open.
/// - `TaskAttemptCommit`: merges committed attempts and finalized files.
/// - `StageCorruption` / `AppDeletion`: recorded for later application,
///   after the stage/app state has been created by the items that
///   precede it in the log.
///
/// If the budget is exceeded mid-replay, the loop stops and `partial` is
/// set; corruption and deletion markers seen so far are still applied and
/// re-persisted so they are not silently dropped from the compacted log.
pub async fn load_state_store(
    executor: &ShuffleExecutor,
    budget: Duration,
) -> anyhow::Result<RecoverySummary> {
    let start = Instant::now();
    let items = executor.state_store.load_data().await?;

    let mut corrupted_stages: HashSet<AppShuffleId> = HashSet::new();
    let mut deleted_apps: HashSet<AppId> = HashSet::new();
    let mut appeared_apps: HashSet<AppId> = HashSet::new();
    let mut partial = false;

    for item in items {
        if start.elapsed() > budget {
            partial = true;
            break;
        }

        match item {
            StateLogItem::StageInfo {
                app_shuffle_id,
                num_maps,
                num_partitions,
                file_start_index,
                write_config,
                file_status,
            } => {
                appeared_apps.insert(app_shuffle_id.app_id.clone());
                match executor.stage_states.get(&app_shuffle_id) {
                    Some(existing) => {
                        let matches = existing
                            .verify_stage_info(num_maps, num_partitions, &write_config)
                            .await;
                        if !matches {
                            corrupted_stages.insert(app_shuffle_id.clone());
                        }
                        existing.bump_file_start_index(file_start_index + write_config.num_splits as i32);
                    }
                    None => {
                        let stage = StageState::new(
                            app_shuffle_id.clone(),
                            file_start_index + write_config.num_splits as i32,
                            std::sync::Arc::clone(&executor.storage),
                            std::sync::Arc::clone(&executor.state_store),
                            executor.config.fsync_enabled,
                        );
                        stage
                            .restore_stage_info(num_maps, num_partitions, write_config, file_status)
                            .await;
                        if file_status.is_corrupted() {
                            corrupted_stages.insert(app_shuffle_id.clone());
                        }
                        executor.stage_states.insert(app_shuffle_id, std::sync::Arc::new(stage));
                    }
                }
            }
            StateLogItem::TaskAttemptCommit {
                app_shuffle_id,
                attempts,
                finalized_files,
            } => {
                if let Some(stage) = executor.stage_states.get(&app_shuffle_id) {
                    stage.apply_recovered_commit(&attempts, finalized_files).await;
                }
            }
            StateLogItem::StageCorruption { app_shuffle_id } => {
                corrupted_stages.insert(app_shuffle_id);
            }
            StateLogItem::AppDeletion { app_id } => {
                deleted_apps.insert(app_id);
            }
        }
    }

    for stage_id in &corrupted_stages {
        if let Some(stage) = executor.stage_states.get(stage_id) {
            stage.set_file_corrupted().await;
        }
        if let Err(e) = executor
            .state_store
            .append(StateLogItem::StageCorruption {
                app_shuffle_id: stage_id.clone(),
            })
            .await
        {
            tracing::warn!(stage = %stage_id, error = %e, "failed to re-persist corruption marker during recovery");
        }
    }

    for app_id in &deleted_apps {
        executor.app_states.remove(app_id);
        let stage_ids: Vec<AppShuffleId> = executor
            .stage_states
            .iter()
            .filter(|e| &e.key().app_id == app_id)
            .map(|e| e.key().clone())
            .collect();
        for stage_id in stage_ids {
            executor.stage_states.remove(&stage_id);
        }
        if let Err(e) = executor
            .state_store
            .append(StateLogItem::AppDeletion { app_id: app_id.clone() })
            .await
        {
            tracing::warn!(app = %app_id, error = %e, "failed to re-persist deletion marker during recovery");
        }
    }

    let mut recovered_apps = 0usize;
    for app_id in &appeared_apps {
        if deleted_apps.contains(app_id) {
            continue;
        }
        executor
            .app_states
            .entry(app_id.clone())
            .or_insert_with(|| std::sync::Arc::new(AppState::new(app_id.clone(), executor.clock.as_ref())));
        recovered_apps += 1;
    }

    executor.state_store.commit().await?;

    let summary = RecoverySummary {
        partial,
        corrupted_stages: corrupted_stages.len(),
        deleted_apps: deleted_apps.len(),
        recovered_apps,
    };

    executor
        .metrics
        .record_state_load_time_millis(start.elapsed().as_millis() as u64);
    if summary.partial {
        executor.metrics.incr_state_partial_loads();
        tracing::warn!("state store recovery hit its time budget; remaining log tail was not replayed");
    }
    for _ in 0..summary.corrupted_stages {
        executor.metrics.incr_state_load_warnings();
    }
    executor.metrics.set_num_live_applications(executor.app_states.len() as u64);

    tracing::info!(
        recovered_apps = summary.recovered_apps,
        corrupted_stages = summary.corrupted_stages,
        deleted_apps = summary.deleted_apps,
        partial = summary.partial,
        "state store recovery complete"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shuffle_types::config::WriteConfig;
    use shuffle_types::metrics::NoopMetricsSink;
    use shuffle_types::time::TestClock;

    use super::*;
    use crate::executor::ShuffleExecutor;
    use crate::state_store::{FileStateStore, StateStore};
    use crate::storage_facade::FsStorageFacade;

    fn stage_id(app: &str, shuffle: i32) -> AppShuffleId {
        AppShuffleId::new(AppId::from(app), shuffle)
    }

    #[tokio::test]
    async fn recovery_rebuilds_stage_and_committed_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("state.log");
        let store = FileStateStore::open(&log_path).await.unwrap();
        let id = stage_id("app-1", 0);

        store
            .append(StateLogItem::StageInfo {
                app_shuffle_id: id.clone(),
                num_maps: 1,
                num_partitions: 1,
                file_start_index: 0,
                write_config: WriteConfig::new(1, "none"),
                file_status: FileStatus::Ok,
            })
            .await
            .unwrap();
        store
            .append(StateLogItem::TaskAttemptCommit {
                app_shuffle_id: id.clone(),
                attempts: vec![shuffle_types::ids::MapTaskAttemptId::new(0, 1)],
                finalized_files: vec![shuffle_types::state_log::FinalizedFile {
                    partition_id: 0,
                    path: "part-0".into(),
                    length: 5,
                }],
            })
            .await
            .unwrap();
        store.commit().await.unwrap();

        let mut config = shuffle_types::config::ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        let executor = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(store),
            Arc::new(TestClock::new(0)),
            Arc::new(NoopMetricsSink),
        );

        let summary = load_state_store(&executor, RECOVERY_BUDGET).await.unwrap();
        assert!(!summary.partial);
        assert_eq!(summary.corrupted_stages, 0);
        assert_eq!(summary.recovered_apps, 1);

        let status = executor.get_shuffle_stage_status(&id).await;
        assert_eq!(status.committed.get(&0), Some(&1));
        assert!(executor.app_states.contains_key(&AppId::from("app-1")));
    }

    #[tokio::test]
    async fn recovery_applies_corruption_and_deletion_markers() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("state.log");
        let store = FileStateStore::open(&log_path).await.unwrap();
        let corrupted = stage_id("app-1", 0);
        let deleted_app = AppId::from("app-2");

        store
            .append(StateLogItem::StageInfo {
                app_shuffle_id: corrupted.clone(),
                num_maps: 1,
                num_partitions: 1,
                file_start_index: 0,
                write_config: WriteConfig::new(1, "none"),
                file_status: FileStatus::Ok,
            })
            .await
            .unwrap();
        store
            .append(StateLogItem::StageCorruption {
                app_shuffle_id: corrupted.clone(),
            })
            .await
            .unwrap();
        store
            .append(StateLogItem::StageInfo {
                app_shuffle_id: stage_id("app-2", 0),
                num_maps: 1,
                num_partitions: 1,
                file_start_index: 0,
                write_config: WriteConfig::new(1, "none"),
                file_status: FileStatus::Ok,
            })
            .await
            .unwrap();
        store
            .append(StateLogItem::AppDeletion {
                app_id: deleted_app.clone(),
            })
            .await
            .unwrap();
        store.commit().await.unwrap();

        let mut config = shuffle_types::config::ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        let executor = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(store),
            Arc::new(TestClock::new(0)),
            Arc::new(NoopMetricsSink),
        );

        let summary = load_state_store(&executor, RECOVERY_BUDGET).await.unwrap();
        assert_eq!(summary.corrupted_stages, 1);
        assert_eq!(summary.deleted_apps, 1);

        let status = executor.get_shuffle_stage_status(&corrupted).await;
        assert_eq!(status.kind, crate::executor::StageStatusKind::Corrupted);
        assert!(!executor.app_states.contains_key(&deleted_app));
        assert!(!executor.stage_states.contains_key(&stage_id("app-2", 0)));
    }

    #[tokio::test]
    async fn zero_budget_marks_recovery_partial() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("state.log");
        let store = FileStateStore::open(&log_path).await.unwrap();
        store
            .append(StateLogItem::StageInfo {
                app_shuffle_id: stage_id("app-1", 0),
                num_maps: 1,
                num_partitions: 1,
                file_start_index: 0,
                write_config: WriteConfig::new(1, "none"),
                file_status: FileStatus::Ok,
            })
            .await
            .unwrap();
        store.commit().await.unwrap();

        let mut config = shuffle_types::config::ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        let executor = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(store),
            Arc::new(TestClock::new(0)),
            Arc::new(NoopMetricsSink),
        );

        let summary = load_state_store(&executor, Duration::from_secs(0)).await.unwrap();
        assert!(summary.partial);
    }
}
