//! Per-`(app, shuffle)` state: map attempt lifecycle, partition writers,
//! the pending-flush queue, the corruption flag, and committed attempts.
//!
//! Two lock domains, deliberately: the hot write path (`write_data`,
//! `mark_start_upload`) only ever touches lock-free `DashMap`s so concurrent
//! writers across different partitions of the same stage never contend with
//! each other. The multi-step protocols (`register`, `finish_upload`,
//! `flush_partitions`, shutdown drain, recovery repair) hold one coarse
//! `tokio::sync::Mutex<StageInner>` for their whole critical section,
//! including the `.await` points inside `flush`/`close` -- this is what
//! makes `(persisted-bytes, committed-map)` observations consistent.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use shuffle_types::config::WriteConfig;
use shuffle_types::error::ShuffleError;
use shuffle_types::ids::{AppShuffleId, MapTaskAttemptId};
use shuffle_types::state_log::{FileStatus, FinalizedFile, StateLogItem};
use tokio::sync::Mutex;

use crate::partition_writer::PartitionWriter;
use crate::state_store::StateStore;
use crate::storage_facade::StorageFacade;

/// Outcome of a `register` call, telling the caller (`ShuffleExecutor`)
/// whether a `StageInfo` log record needs to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration; the caller must persist `StageInfo`.
    FirstRegistration,
    /// Already registered with an identical shape; nothing to persist.
    AlreadyRegistered,
    /// A mismatched re-registration; the stage is now corrupted.
    Mismatch,
}

struct PartitionHandle {
    writer: Arc<PartitionWriter>,
    path: String,
}

struct StageInner {
    num_maps: Option<i32>,
    num_partitions: Option<i32>,
    write_config: Option<WriteConfig>,
    file_status: FileStatus,
    finished_uploads: HashSet<MapTaskAttemptId>,
    pending_flush: Vec<MapTaskAttemptId>,
    pending_flush_set: HashSet<MapTaskAttemptId>,
    committed: HashMap<i32, i64>,
    finalized_files: HashMap<i32, Vec<FinalizedFile>>,
}

impl StageInner {
    fn new() -> Self {
        Self {
            num_maps: None,
            num_partitions: None,
            write_config: None,
            file_status: FileStatus::Ok,
            finished_uploads: HashSet::new(),
            pending_flush: Vec::new(),
            pending_flush_set: HashSet::new(),
            committed: HashMap::new(),
            finalized_files: HashMap::new(),
        }
    }
}

pub struct StageState {
    app_shuffle_id: AppShuffleId,
    file_start_index: AtomicI32,
    storage: Arc<dyn StorageFacade>,
    state_store: Arc<dyn StateStore>,
    fsync_enabled: bool,
    writers: DashMap<i32, PartitionHandle>,
    writer_create_lock: Mutex<()>,
    latest_attempt_per_map: DashMap<i32, i64>,
    inner: Mutex<StageInner>,
}

impl StageState {
    #[must_use]
    pub fn new(
        app_shuffle_id: AppShuffleId,
        file_start_index: i32,
        storage: Arc<dyn StorageFacade>,
        state_store: Arc<dyn StateStore>,
        fsync_enabled: bool,
    ) -> Self {
        Self {
            app_shuffle_id,
            file_start_index: AtomicI32::new(file_start_index),
            storage,
            state_store,
            fsync_enabled,
            writers: DashMap::new(),
            writer_create_lock: Mutex::new(()),
            latest_attempt_per_map: DashMap::new(),
            inner: Mutex::new(StageInner::new()),
        }
    }

    #[must_use]
    pub fn app_shuffle_id(&self) -> &AppShuffleId {
        &self.app_shuffle_id
    }

    #[must_use]
    pub fn file_start_index(&self) -> i32 {
        self.file_start_index.load(Ordering::Acquire)
    }

    /// Bumps `file_start_index` up to `candidate`, never down. Used only by
    /// recovery.
    pub fn bump_file_start_index(&self, candidate: i32) {
        self.file_start_index.fetch_max(candidate, Ordering::AcqRel);
    }

    /// First registration sets `num_maps`/`num_partitions`/`write_config`
    /// and returns `FirstRegistration`. A later call with an identical
    /// shape is a no-op; any mismatch marks the stage corrupted.
    pub async fn register(
        &self,
        num_maps: i32,
        num_partitions: i32,
        write_config: WriteConfig,
    ) -> RegisterOutcome {
        let mut inner = self.inner.lock().await;
        match (&inner.num_maps, &inner.num_partitions, &inner.write_config) {
            (None, None, None) => {
                inner.num_maps = Some(num_maps);
                inner.num_partitions = Some(num_partitions);
                inner.write_config = Some(write_config);
                RegisterOutcome::FirstRegistration
            }
            (Some(nm), Some(np), Some(wc))
                if *nm == num_maps && *np == num_partitions && *wc == write_config =>
            {
                RegisterOutcome::AlreadyRegistered
            }
            _ => {
                inner.file_status = FileStatus::Corrupted;
                RegisterOutcome::Mismatch
            }
        }
    }

    /// Directly installs recovered shape (used by startup recovery, which
    /// bypasses the three-way `register` comparison since it's replaying a
    /// log rather than handling a live mapper connection).
    pub async fn restore_stage_info(
        &self,
        num_maps: i32,
        num_partitions: i32,
        write_config: WriteConfig,
        file_status: FileStatus,
    ) {
        let mut inner = self.inner.lock().await;
        inner.num_maps = Some(num_maps);
        inner.num_partitions = Some(num_partitions);
        inner.write_config = Some(write_config);
        inner.file_status = file_status;
    }

    /// Verifies a recovered `StageInfo` against an already-recreated stage;
    /// marks corrupted on mismatch. Used during recovery when the same
    /// stage appears more than once in the log.
    pub async fn verify_stage_info(
        &self,
        num_maps: i32,
        num_partitions: i32,
        write_config: &WriteConfig,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let matches = inner.num_maps == Some(num_maps)
            && inner.num_partitions == Some(num_partitions)
            && inner.write_config.as_ref() == Some(write_config);
        if !matches {
            inner.file_status = FileStatus::Corrupted;
        }
        matches
    }

    pub fn mark_start_upload(&self, map_id: i32, task_attempt_id: i64) {
        self.latest_attempt_per_map.insert(map_id, task_attempt_id);
    }

    #[must_use]
    pub fn latest_attempt_for_map(&self, map_id: i32) -> Option<i64> {
        self.latest_attempt_per_map.get(&map_id).map(|v| *v)
    }

    pub async fn mark_finish_upload(&self, attempt: MapTaskAttemptId) {
        let mut inner = self.inner.lock().await;
        mark_finish_upload_locked(&mut inner, attempt);
    }

    pub async fn add_pending_flush(&self, attempt: MapTaskAttemptId) {
        let mut inner = self.inner.lock().await;
        add_pending_flush_locked(&mut inner, attempt);
    }

    pub async fn fetch_flush_map_attempts(&self) -> Vec<MapTaskAttemptId> {
        let mut inner = self.inner.lock().await;
        // TODO close all files if there are only stale attempts
        fetch_flush_locked(&mut inner)
    }

    /// `finishUpload`'s three steps (`markFinishUpload`, `addPendingFlush`,
    /// `fetchFlushMapAttempts`) as one atomic critical section, matching the
    /// "under the stage mutex" requirement -- calling the three public
    /// methods above separately would release and reacquire the lock
    /// between them.
    pub async fn finish_upload(&self, attempt: MapTaskAttemptId) -> Vec<MapTaskAttemptId> {
        let mut inner = self.inner.lock().await;
        mark_finish_upload_locked(&mut inner, attempt);
        add_pending_flush_locked(&mut inner, attempt);
        fetch_flush_locked(&mut inner)
    }

    async fn get_or_create_writer(&self, partition_id: i32) -> anyhow::Result<Arc<PartitionWriter>> {
        if let Some(handle) = self.writers.get(&partition_id) {
            return Ok(Arc::clone(&handle.writer));
        }
        let _guard = self.writer_create_lock.lock().await;
        if let Some(handle) = self.writers.get(&partition_id) {
            return Ok(Arc::clone(&handle.writer));
        }
        let file_index = self.file_start_index();
        let path = self.storage.partition_path(
            self.app_shuffle_id.app_id.as_str(),
            self.app_shuffle_id.shuffle_id,
            partition_id,
            file_index,
        );
        let file = self.storage.open_append(&path).await?;
        let writer = Arc::new(PartitionWriter::new(file, self.fsync_enabled));
        self.writers.insert(
            partition_id,
            PartitionHandle {
                writer: Arc::clone(&writer),
                path: path.display().to_string(),
            },
        );
        Ok(writer)
    }

    /// Appends `bytes` to the partition's writer, creating it lazily.
    /// Ownership of `bytes` transfers in regardless of outcome.
    pub async fn write_data(&self, partition_id: i32, bytes: Vec<u8>) -> anyhow::Result<()> {
        let writer = self.get_or_create_writer(partition_id).await?;
        writer.write_data(bytes)
    }

    /// The commit protocol, steps 1-4 under the stage mutex: flush every
    /// live writer, commit the given attempts, persist a single
    /// `TaskAttemptCommit` log record, and close all writers if every map's
    /// latest attempt is now committed. Any failure along the way (step 5)
    /// sets the stage corrupted and persists `StageCorruption` before the
    /// mutex is released, so no other caller can observe a committed stage
    /// with an unpersisted commit. Returns the post-flush snapshot for
    /// every partition.
    pub async fn flush_partitions(
        &self,
        attempts: &[MapTaskAttemptId],
    ) -> anyhow::Result<Vec<FinalizedFile>> {
        let mut inner = self.inner.lock().await;

        match self.flush_partitions_locked(&mut inner, attempts).await {
            Ok(files) => Ok(files),
            Err(e) => {
                inner.file_status = FileStatus::Corrupted;
                if let Err(persist_err) = self
                    .state_store
                    .append(StateLogItem::StageCorruption {
                        app_shuffle_id: self.app_shuffle_id.clone(),
                    })
                    .await
                {
                    tracing::warn!(
                        stage = %self.app_shuffle_id,
                        error = %persist_err,
                        "failed to persist stage corruption marker"
                    );
                }
                Err(e)
            }
        }
    }

    async fn flush_partitions_locked(
        &self,
        inner: &mut StageInner,
        attempts: &[MapTaskAttemptId],
    ) -> anyhow::Result<Vec<FinalizedFile>> {
        for entry in self.writers.iter() {
            let partition_id = *entry.key();
            entry.writer.flush().await?;
            let finalized = FinalizedFile {
                partition_id,
                path: entry.path.clone(),
                length: entry.writer.persisted_length(),
            };
            inner.finalized_files.insert(partition_id, vec![finalized]);
        }

        for attempt in attempts {
            inner.committed.insert(attempt.map_id, attempt.task_attempt_id);
        }

        let finalized_files: Vec<FinalizedFile> = inner.finalized_files.values().flatten().cloned().collect();

        self.state_store
            .append(StateLogItem::TaskAttemptCommit {
                app_shuffle_id: self.app_shuffle_id.clone(),
                attempts: attempts.to_vec(),
                finalized_files: finalized_files.clone(),
            })
            .await?;

        if all_committed_locked(inner, &self.latest_attempt_per_map) {
            for entry in self.writers.iter() {
                entry.writer.close().await?;
            }
        }

        Ok(finalized_files)
    }

    /// Replays a recovered `TaskAttemptCommit`: merges committed attempts
    /// and finalized files without touching any live writer (none exist
    /// yet during recovery). Overwrites any prior snapshot for a partition,
    /// matching `flush_partitions`'s live representation -- the log's
    /// `finalized_files` for a partition is always the latest post-flush
    /// snapshot, not a history of every commit that ever touched it.
    pub async fn apply_recovered_commit(
        &self,
        attempts: &[MapTaskAttemptId],
        finalized_files: Vec<FinalizedFile>,
    ) {
        let mut inner = self.inner.lock().await;
        for attempt in attempts {
            inner.committed.insert(attempt.map_id, attempt.task_attempt_id);
        }
        for file in finalized_files {
            inner.finalized_files.insert(file.partition_id, vec![file]);
        }
    }

    pub async fn all_latest_task_attempts_committed(&self) -> bool {
        let inner = self.inner.lock().await;
        all_committed_locked(&inner, &self.latest_attempt_per_map)
    }

    pub async fn close_writers(&self) -> anyhow::Result<()> {
        for entry in self.writers.iter() {
            entry.writer.close().await?;
        }
        Ok(())
    }

    pub async fn close_partition(&self, partition_id: i32) -> anyhow::Result<()> {
        if let Some(entry) = self.writers.get(&partition_id) {
            entry.writer.close().await?;
        }
        Ok(())
    }

    pub async fn set_file_corrupted(&self) {
        self.inner.lock().await.file_status = FileStatus::Corrupted;
    }

    pub async fn is_corrupted(&self) -> bool {
        self.inner.lock().await.file_status.is_corrupted()
    }

    pub async fn get_shuffle_stage_status(&self) -> (FileStatus, HashMap<i32, i64>) {
        let inner = self.inner.lock().await;
        (inner.file_status, inner.committed.clone())
    }

    pub async fn get_write_config(&self) -> Option<WriteConfig> {
        self.inner.lock().await.write_config.clone()
    }

    pub async fn get_persisted_files(&self, partition_id: i32) -> Vec<FinalizedFile> {
        self.inner
            .lock()
            .await
            .finalized_files
            .get(&partition_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn shape(&self) -> Option<(i32, i32)> {
        let inner = self.inner.lock().await;
        match (inner.num_maps, inner.num_partitions) {
            (Some(nm), Some(np)) => Some((nm, np)),
            _ => None,
        }
    }

    pub async fn to_corrupted_state_error(&self, reason: impl Into<String>) -> ShuffleError {
        self.set_file_corrupted().await;
        ShuffleError::StageCorrupted {
            stage: self.app_shuffle_id.clone(),
            reason: reason.into(),
        }
    }
}

fn mark_finish_upload_locked(inner: &mut StageInner, attempt: MapTaskAttemptId) {
    inner.finished_uploads.insert(attempt);
}

fn add_pending_flush_locked(inner: &mut StageInner, attempt: MapTaskAttemptId) {
    if inner.pending_flush_set.insert(attempt) {
        inner.pending_flush.push(attempt);
    }
}

fn fetch_flush_locked(inner: &mut StageInner) -> Vec<MapTaskAttemptId> {
    inner.pending_flush_set.clear();
    std::mem::take(&mut inner.pending_flush)
}

fn all_committed_locked(inner: &StageInner, latest_attempt_per_map: &DashMap<i32, i64>) -> bool {
    let Some(num_maps) = inner.num_maps else {
        return false;
    };
    (0..num_maps).all(|map_id| {
        let latest = latest_attempt_per_map.get(&map_id).map(|v| *v);
        let committed = inner.committed.get(&map_id).copied();
        latest.is_some() && latest == committed
    })
}
