//! Orchestrates `AppState`/`StageState`/`StateStore`: routes every public
//! operation, runs periodic expiry, performs startup recovery, and enforces
//! per-application write quotas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use shuffle_types::config::{ExecutorConfig, WriteConfig};
use shuffle_types::error::ShuffleError;
use shuffle_types::ids::{AppId, AppMapId, AppShuffleId, AppTaskAttemptId};
use shuffle_types::metrics::MetricsSink;
use shuffle_types::state_log::{FileStatus, FinalizedFile, StateLogItem};
use shuffle_types::time::Clock;
use tokio::task::JoinHandle;

use crate::app_state::AppState;
use crate::expiry::Scheduler;
use crate::stage_state::{RegisterOutcome, StageState};
use crate::state_store::StateStore;
use crate::storage_facade::StorageFacade;

/// One record to append to one partition of one shuffle stage.
pub struct WriteOp {
    pub app_shuffle_id: AppShuffleId,
    pub map_id: i32,
    pub task_attempt_id: i64,
    pub partition_id: i32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatusKind {
    /// No `registerShuffle` has ever been observed for this stage.
    NotStarted,
    Ok,
    Corrupted,
}

#[derive(Debug, Clone)]
pub struct StageStatus {
    pub kind: StageStatusKind,
    pub committed: HashMap<i32, i64>,
}

pub struct ShuffleExecutor {
    pub(crate) config: ExecutorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) storage: Arc<dyn StorageFacade>,
    pub(crate) state_store: Arc<dyn StateStore>,
    pub(crate) app_states: DashMap<AppId, Arc<AppState>>,
    pub(crate) stage_states: DashMap<AppShuffleId, Arc<StageState>>,
    last_commit_millis: AtomicI64,
    scheduler: Scheduler,
}

impl ShuffleExecutor {
    #[must_use]
    pub fn new(
        config: ExecutorConfig,
        storage: Arc<dyn StorageFacade>,
        state_store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            metrics,
            storage,
            state_store,
            app_states: DashMap::new(),
            stage_states: DashMap::new(),
            last_commit_millis: AtomicI64::new(0),
            scheduler: Scheduler::new(),
        })
    }

    /// Replays the durable log, rebuilding in-memory stage/app state.
    /// Should be called once, before serving any other operation.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<crate::recovery::RecoverySummary> {
        crate::recovery::load_state_store(self, crate::recovery::RECOVERY_BUDGET).await
    }

    /// Starts the periodic expiry task; stopped by `stop`.
    pub fn spawn_expiry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        crate::expiry::spawn_expiry_loop(Arc::clone(self), self.scheduler.shutdown_receiver())
    }

    fn get_or_create_app(&self, app_id: &AppId) -> Arc<AppState> {
        let entry = self
            .app_states
            .entry(app_id.clone())
            .or_insert_with(|| Arc::new(AppState::new(app_id.clone(), self.clock.as_ref())));
        Arc::clone(&entry)
    }

    pub(crate) fn get_or_create_stage(&self, app_shuffle_id: &AppShuffleId) -> Arc<StageState> {
        let entry = self.stage_states.entry(app_shuffle_id.clone()).or_insert_with(|| {
            Arc::new(StageState::new(
                app_shuffle_id.clone(),
                0,
                Arc::clone(&self.storage),
                Arc::clone(&self.state_store),
                self.config.fsync_enabled,
            ))
        });
        Arc::clone(&entry)
    }

    fn touch_app(&self, app_id: &AppId) -> Arc<AppState> {
        let app = self.get_or_create_app(app_id);
        app.touch(self.clock.as_ref());
        app
    }

    async fn persist_corruption(&self, app_shuffle_id: &AppShuffleId) {
        if let Err(e) = self
            .state_store
            .append(StateLogItem::StageCorruption {
                app_shuffle_id: app_shuffle_id.clone(),
            })
            .await
        {
            tracing::warn!(stage = %app_shuffle_id, error = %e, "failed to persist stage corruption marker");
        }
    }

    pub async fn register_shuffle(
        &self,
        app_shuffle_id: AppShuffleId,
        num_maps: i32,
        num_partitions: i32,
        write_config: WriteConfig,
    ) -> Result<(), ShuffleError> {
        self.touch_app(&app_shuffle_id.app_id);
        let stage = self.get_or_create_stage(&app_shuffle_id);
        let outcome = stage.register(num_maps, num_partitions, write_config.clone()).await;

        match outcome {
            RegisterOutcome::FirstRegistration => {
                let item = StateLogItem::StageInfo {
                    app_shuffle_id: app_shuffle_id.clone(),
                    num_maps,
                    num_partitions,
                    file_start_index: stage.file_start_index(),
                    write_config,
                    file_status: FileStatus::Ok,
                };
                self.state_store.append(item).await.map_err(wrap_io)?;
                tracing::info!(stage = %app_shuffle_id, %num_maps, %num_partitions, "shuffle stage registered");
                Ok(())
            }
            RegisterOutcome::AlreadyRegistered => Ok(()),
            RegisterOutcome::Mismatch => {
                self.persist_corruption(&app_shuffle_id).await;
                tracing::warn!(stage = %app_shuffle_id, "shuffle stage re-registered with mismatched shape");
                Err(ShuffleError::StageCorrupted {
                    stage: app_shuffle_id,
                    reason: "register shape mismatch".into(),
                })
            }
        }
    }

    fn check_quota(&self, app: &AppState, app_shuffle_id: &AppShuffleId) -> Result<(), ShuffleError> {
        if app.num_write_bytes() > self.config.app_max_write_bytes {
            return Err(ShuffleError::QuotaExceeded(app_shuffle_id.clone()));
        }
        Ok(())
    }

    pub async fn start_upload(&self, attempt: AppTaskAttemptId) -> Result<(), ShuffleError> {
        let app = self.touch_app(&attempt.app_shuffle_id().app_id);
        let stage = self.get_or_create_stage(attempt.app_shuffle_id());

        if let Err(e) = self.check_quota(&app, attempt.app_shuffle_id()) {
            self.metrics.incr_num_truncated_applications();
            stage.set_file_corrupted().await;
            self.persist_corruption(attempt.app_shuffle_id()).await;
            return Err(e);
        }

        stage.mark_start_upload(attempt.map_id(), attempt.task_attempt_id);
        Ok(())
    }

    pub async fn write_data(&self, op: WriteOp) -> Result<(), ShuffleError> {
        let app = self.touch_app(&op.app_shuffle_id.app_id);
        let total = app.add_write_bytes(op.bytes.len() as u64);
        let stage = self.get_or_create_stage(&op.app_shuffle_id);

        if total > self.config.app_max_write_bytes {
            self.metrics.incr_num_truncated_applications();
            stage.set_file_corrupted().await;
            self.persist_corruption(&op.app_shuffle_id).await;
            return Err(ShuffleError::QuotaExceeded(op.app_shuffle_id));
        }

        if let Err(e) = stage.write_data(op.partition_id, op.bytes).await {
            stage.set_file_corrupted().await;
            self.persist_corruption(&op.app_shuffle_id).await;
            return Err(wrap_io(e));
        }
        Ok(())
    }

    /// `finishUpload`: drains the pending-flush queue under the stage
    /// mutex; if non-empty, hands the drained attempts to a background
    /// flush task. Never propagates a flush failure to the caller.
    pub fn finish_upload(self: &Arc<Self>, attempt: AppTaskAttemptId) {
        let app_shuffle_id = attempt.app_shuffle_id().clone();
        let stage = self.get_or_create_stage(&app_shuffle_id);
        let map_attempt = attempt.map_task_attempt_id();
        let enqueued_at = self.clock.now_millis();
        let executor = Arc::clone(self);

        tokio::spawn(async move {
            let drained = stage.finish_upload(map_attempt).await;
            if drained.is_empty() {
                return;
            }
            let _guard = executor.scheduler.in_flight_guard();
            let start = executor.clock.now_millis();
            executor
                .metrics
                .record_map_attempt_flush_delay_millis((start - enqueued_at).max(0) as u64);

            let attempts: Vec<AppTaskAttemptId> = drained
                .into_iter()
                .map(|m| AppTaskAttemptId::new(AppMapId::new(app_shuffle_id.clone(), m.map_id), m.task_attempt_id))
                .collect();

            if let Err(e) = executor.flush_partitions(&attempts).await {
                tracing::warn!(stage = %app_shuffle_id, error = %e, "flush failed, stage marked corrupted");
            }

            let elapsed = (executor.clock.now_millis() - start).max(0) as u64;
            executor.metrics.record_map_attempt_flush_time_millis(elapsed);
        });
    }

    /// The core commit protocol. Precondition: every attempt shares the
    /// same `appShuffleId` -- a caller handing us attempts spanning more
    /// than one stage is a scheduling bug, not a user error, so this fails
    /// loudly instead of silently picking one stage. Delegates the actual
    /// flush/commit/close sequence to `StageState::flush_partitions`,
    /// which persists the `TaskAttemptCommit` under its own stage mutex and
    /// handles corruption on failure; this method only decides which stage
    /// to route to and whether the periodic state-store commit is due.
    async fn flush_partitions(&self, attempts: &[AppTaskAttemptId]) -> anyhow::Result<()> {
        let Some(first) = attempts.first() else {
            return Ok(());
        };
        let app_shuffle_id = first.app_shuffle_id().clone();
        if attempts.iter().any(|a| a.app_shuffle_id() != &app_shuffle_id) {
            return Err(ShuffleError::InvalidState(
                "flush_partitions called with attempts spanning more than one stage".into(),
            )
            .into());
        }

        let stage = self.get_or_create_stage(&app_shuffle_id);
        let map_attempts: Vec<shuffle_types::ids::MapTaskAttemptId> =
            attempts.iter().map(AppTaskAttemptId::map_task_attempt_id).collect();

        stage.flush_partitions(&map_attempts).await?;
        self.maybe_commit_state_store().await;
        Ok(())
    }

    async fn maybe_commit_state_store(&self) {
        let now = self.clock.now_millis();
        let last = self.last_commit_millis.load(Ordering::Acquire);
        if now - last >= self.config.state_commit_interval_millis as i64 {
            if let Err(e) = self.state_store.commit().await {
                tracing::warn!(error = %e, "state store commit failed");
            }
            self.last_commit_millis.store(now, Ordering::Release);
        }
    }

    pub async fn get_persisted_bytes(
        &self,
        app_shuffle_id: &AppShuffleId,
        partition_id: i32,
    ) -> Vec<FinalizedFile> {
        self.touch_app(&app_shuffle_id.app_id);
        let stage = self.get_or_create_stage(app_shuffle_id);
        stage.get_persisted_files(partition_id).await
    }

    pub async fn close_partition_files(
        &self,
        app_shuffle_id: &AppShuffleId,
        partition_id: i32,
    ) -> Result<(), ShuffleError> {
        let stage = self.get_or_create_stage(app_shuffle_id);
        stage.close_partition(partition_id).await.map_err(wrap_io)
    }

    pub async fn get_shuffle_stage_status(&self, app_shuffle_id: &AppShuffleId) -> StageStatus {
        match self.stage_states.get(app_shuffle_id) {
            Some(stage) => {
                let (status, committed) = stage.get_shuffle_stage_status().await;
                StageStatus {
                    kind: if status.is_corrupted() {
                        StageStatusKind::Corrupted
                    } else {
                        StageStatusKind::Ok
                    },
                    committed,
                }
            }
            None => StageStatus {
                kind: StageStatusKind::NotStarted,
                committed: HashMap::new(),
            },
        }
    }

    pub async fn get_shuffle_write_config(
        &self,
        app_shuffle_id: &AppShuffleId,
    ) -> Result<WriteConfig, ShuffleError> {
        let Some(stage) = self.stage_states.get(app_shuffle_id).map(|e| Arc::clone(&e)) else {
            return Err(ShuffleError::StageNotStarted(app_shuffle_id.clone()));
        };
        stage
            .get_write_config()
            .await
            .ok_or_else(|| ShuffleError::StageNotStarted(app_shuffle_id.clone()))
    }

    /// Runs every 60 seconds from [`spawn_expiry_loop`]: removes apps
    /// inactive beyond `app_retention_millis`, closing their stages'
    /// writers and scheduling directory deletion. Errors along the way are
    /// logged, never fatal to the loop.
    pub async fn remove_expired_applications(&self) {
        let now = self.clock.now_millis();
        let expired: Vec<AppId> = self
            .app_states
            .iter()
            .filter(|entry| entry.value().is_expired(now, self.config.app_retention_millis))
            .map(|entry| entry.key().clone())
            .collect();

        for app_id in expired {
            self.app_states.remove(&app_id);

            let stage_ids: Vec<AppShuffleId> = self
                .stage_states
                .iter()
                .filter(|entry| entry.key().app_id == app_id)
                .map(|entry| entry.key().clone())
                .collect();

            for stage_id in &stage_ids {
                if let Some((_, stage)) = self.stage_states.remove(stage_id) {
                    if let Err(e) = stage.close_writers().await {
                        tracing::warn!(stage = %stage_id, error = %e, "failed to close writers during expiry");
                    }
                }
            }

            if let Err(e) = self
                .state_store
                .append(StateLogItem::AppDeletion { app_id: app_id.clone() })
                .await
            {
                tracing::warn!(app = %app_id, error = %e, "failed to persist app deletion");
            }

            let dir = self.config.root_dir.join(app_id.as_str());
            if let Err(e) = self.storage.delete_directory(&dir).await {
                tracing::warn!(app = %app_id, error = %e, "failed to delete application directory");
            }

            self.metrics.incr_num_expired_applications();
            tracing::info!(app = %app_id, "application expired");
        }

        self.metrics.set_num_live_applications(self.app_states.len() as u64);
    }

    /// Shuts down the background scheduler (optionally waiting up to a
    /// 3-minute grace period for in-flight flushes), drains every stage's
    /// pending flush under its own mutex, then closes the state store.
    pub async fn stop(&self, wait: bool) {
        self.scheduler.trigger_shutdown();
        if wait {
            self.scheduler.wait_for_drain(Duration::from_secs(180)).await;
        }

        for entry in self.stage_states.iter() {
            let app_shuffle_id = entry.key().clone();
            let stage = Arc::clone(entry.value());

            let pending = stage.fetch_flush_map_attempts().await;
            if !pending.is_empty() {
                let attempts: Vec<AppTaskAttemptId> = pending
                    .into_iter()
                    .map(|m| AppTaskAttemptId::new(AppMapId::new(app_shuffle_id.clone(), m.map_id), m.task_attempt_id))
                    .collect();
                if let Err(e) = self.flush_partitions(&attempts).await {
                    tracing::warn!(stage = %app_shuffle_id, error = %e, "flush failed during shutdown");
                }
            }
            if let Err(e) = stage.close_writers().await {
                tracing::warn!(stage = %app_shuffle_id, error = %e, "failed to close writers during shutdown");
            }
        }

        if let Err(e) = self.state_store.close().await {
            tracing::warn!(error = %e, "failed to close state store");
        }
    }
}

fn wrap_io(e: anyhow::Error) -> ShuffleError {
    std::io::Error::other(e).into()
}

#[cfg(test)]
mod tests {
    use shuffle_types::metrics::{NoopMetricsSink, RecordingTestSink};
    use shuffle_types::time::TestClock;

    use super::*;
    use crate::state_store::MemoryStateStore;
    use crate::storage_facade::FsStorageFacade;

    fn executor(dir: &std::path::Path, clock: TestClock) -> Arc<ShuffleExecutor> {
        let mut config = ExecutorConfig::default();
        config.root_dir = dir.to_path_buf();
        ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir)),
            Arc::new(MemoryStateStore::new()),
            Arc::new(clock),
            Arc::new(NoopMetricsSink),
        )
    }

    fn stage_id(app: &str, shuffle: i32) -> AppShuffleId {
        AppShuffleId::new(AppId::from(app), shuffle)
    }

    #[tokio::test]
    async fn happy_path_registers_writes_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), TestClock::new(0));
        let stage = stage_id("app-1", 1);

        exec.register_shuffle(stage.clone(), 2, 3, WriteConfig::new(1, "none"))
            .await
            .unwrap();

        let attempt0 = AppTaskAttemptId::new(
            shuffle_types::ids::AppMapId::new(stage.clone(), 0),
            1,
        );
        exec.start_upload(attempt0.clone()).await.unwrap();
        exec.write_data(WriteOp {
            app_shuffle_id: stage.clone(),
            map_id: 0,
            task_attempt_id: 1,
            partition_id: 0,
            bytes: b"abc".to_vec(),
        })
        .await
        .unwrap();
        exec.finish_upload(attempt0);

        let attempt1 = AppTaskAttemptId::new(
            shuffle_types::ids::AppMapId::new(stage.clone(), 1),
            7,
        );
        exec.start_upload(attempt1.clone()).await.unwrap();
        exec.write_data(WriteOp {
            app_shuffle_id: stage.clone(),
            map_id: 1,
            task_attempt_id: 7,
            partition_id: 1,
            bytes: b"de".to_vec(),
        })
        .await
        .unwrap();
        exec.finish_upload(attempt1);

        // Flush tasks are spawned; give them a chance to run.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = exec.get_shuffle_stage_status(&stage).await;
        assert_eq!(status.kind, StageStatusKind::Ok);
        assert_eq!(status.committed.get(&0), Some(&1));
        assert_eq!(status.committed.get(&1), Some(&7));
    }

    #[tokio::test]
    async fn quota_exceeded_corrupts_stage_and_counts_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RecordingTestSink::default());
        let mut config = ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        config.app_max_write_bytes = 100;
        let exec = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(crate::state_store::MemoryStateStore::new()),
            Arc::new(TestClock::new(0)),
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );

        let stage = stage_id("app-1", 0);
        exec.register_shuffle(stage.clone(), 1, 1, WriteConfig::new(1, "none"))
            .await
            .unwrap();

        let result = exec
            .write_data(WriteOp {
                app_shuffle_id: stage.clone(),
                map_id: 0,
                task_attempt_id: 1,
                partition_id: 0,
                bytes: vec![0u8; 101],
            })
            .await;

        assert!(matches!(result, Err(ShuffleError::QuotaExceeded(_))));
        let status = exec.get_shuffle_stage_status(&stage).await;
        assert_eq!(status.kind, StageStatusKind::Corrupted);
        assert_eq!(
            metrics.num_truncated_applications.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn start_upload_quota_exceeded_corrupts_stage_and_counts_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(RecordingTestSink::default());
        let mut config = ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        config.app_max_write_bytes = 10;
        let exec = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(crate::state_store::MemoryStateStore::new()),
            Arc::new(TestClock::new(0)),
            Arc::clone(&metrics) as Arc<dyn MetricsSink>,
        );

        let stage = stage_id("app-1", 0);
        exec.register_shuffle(stage.clone(), 2, 1, WriteConfig::new(1, "none"))
            .await
            .unwrap();

        // Pushes the app over quota without going through start_upload.
        let result = exec
            .write_data(WriteOp {
                app_shuffle_id: stage.clone(),
                map_id: 0,
                task_attempt_id: 1,
                partition_id: 0,
                bytes: vec![0u8; 11],
            })
            .await;
        assert!(matches!(result, Err(ShuffleError::QuotaExceeded(_))));

        // The app is already over quota, so starting a second map's upload
        // must also be rejected -- and must corrupt/persist/count on its
        // own, not merely observe a stage that write_data already corrupted.
        let attempt1 = AppTaskAttemptId::new(AppMapId::new(stage.clone(), 1), 1);
        let result = exec.start_upload(attempt1).await;

        assert!(matches!(result, Err(ShuffleError::QuotaExceeded(_))));
        let status = exec.get_shuffle_stage_status(&stage).await;
        assert_eq!(status.kind, StageStatusKind::Corrupted);
        assert_eq!(
            metrics.num_truncated_applications.load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn register_mismatch_fails_and_corrupts() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), TestClock::new(0));
        let stage = stage_id("app-1", 0);

        exec.register_shuffle(stage.clone(), 4, 10, WriteConfig::new(1, "none"))
            .await
            .unwrap();
        let result = exec
            .register_shuffle(stage.clone(), 5, 10, WriteConfig::new(1, "none"))
            .await;

        assert!(matches!(result, Err(ShuffleError::StageCorrupted { .. })));
        let status = exec.get_shuffle_stage_status(&stage).await;
        assert_eq!(status.kind, StageStatusKind::Corrupted);
    }

    #[tokio::test]
    async fn unknown_stage_status_is_not_started_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), TestClock::new(0));
        let status = exec.get_shuffle_stage_status(&stage_id("app-1", 99)).await;
        assert_eq!(status.kind, StageStatusKind::NotStarted);
    }

    #[tokio::test]
    async fn expiry_removes_inactive_application_state_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let clock = TestClock::new(0);
        let mut config = ExecutorConfig::default();
        config.root_dir = dir.path().to_path_buf();
        config.app_retention_millis = 1_000;
        let exec = ShuffleExecutor::new(
            config,
            Arc::new(FsStorageFacade::new(dir.path())),
            Arc::new(crate::state_store::MemoryStateStore::new()),
            Arc::new(clock.clone()),
            Arc::new(NoopMetricsSink),
        );

        let stage = stage_id("app-1", 0);
        exec.register_shuffle(stage.clone(), 1, 1, WriteConfig::new(1, "none"))
            .await
            .unwrap();

        clock.advance(2_000);
        exec.remove_expired_applications().await;

        assert!(exec.app_states.is_empty());
        assert!(exec.stage_states.is_empty());
    }
}
