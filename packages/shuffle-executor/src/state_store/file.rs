//! Durable `StateStore`, a length-prefixed, `bincode`-framed append log with
//! a trailing-torn-record-tolerant reader and commit-time compaction.
//!
//! Frame layout: `[len: u32 LE][crc32c(payload): u32 LE][payload: bincode(StateLogItem)]`.
//! A frame whose header or payload runs past EOF is a torn write from a
//! process that died mid-append; the reader stops there rather than erroring,
//! matching "the loader must accept a trailing torn record" from the
//! recovery contract.

use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use shuffle_types::ids::{AppId, AppShuffleId};
use shuffle_types::state_log::StateLogItem;
use tokio::sync::Mutex;

use super::StateStore;

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

pub struct FileStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    file: std::fs::File,
    items: Vec<StateLogItem>,
}

impl FileStateStore {
    /// Opens (creating if absent) the log at `path` and eagerly replays any
    /// well-formed frames already present, so `commit`'s compaction has an
    /// accurate view of history from the very first call.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let path_for_blocking = path.clone();
        let (file, items) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            if let Some(parent) = path_for_blocking.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let items = read_frames(&path_for_blocking)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path_for_blocking)?;
            Ok((file, items))
        })
        .await??;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, items }),
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn append(&self, item: StateLogItem) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let frame = encode_frame(&item)?;
        // `try_clone` duplicates the fd, not the open-file description's
        // append semantics -- with `O_APPEND` set, every write still lands
        // at the current end-of-file regardless of which clone issues it.
        let mut handle = inner.file.try_clone()?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            handle.write_all(&frame)?;
            Ok(())
        })
        .await??;
        inner.items.push(item);
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let handle = inner.file.try_clone()?;
        tokio::task::spawn_blocking(move || handle.sync_data()).await??;

        let compacted = compact(&inner.items);
        if compacted.len() == inner.items.len() {
            return Ok(());
        }

        let path = self.path.clone();
        let encoded: Vec<u8> = compacted
            .iter()
            .map(encode_frame)
            .collect::<anyhow::Result<Vec<_>>>()?
            .concat();

        let new_file = tokio::task::spawn_blocking(move || -> anyhow::Result<std::fs::File> {
            let tmp_path = path.with_extension("compact.tmp");
            {
                let mut tmp = std::fs::File::create(&tmp_path)?;
                tmp.write_all(&encoded)?;
                tmp.sync_data()?;
            }
            std::fs::rename(&tmp_path, &path)?;
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            Ok(file)
        })
        .await??;

        inner.file = new_file;
        inner.items = compacted;
        Ok(())
    }

    async fn load_data(&self) -> anyhow::Result<Vec<StateLogItem>> {
        Ok(self.inner.lock().await.items.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // File is released on drop; nothing to flush beyond what `commit`
        // already guarantees durable.
        Ok(())
    }
}

fn encode_frame(item: &StateLogItem) -> anyhow::Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(item, BINCODE_CONFIG)?;
    let checksum = crc32c::crc32c(&payload);
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads every well-formed frame from `path`. Stops at the first header or
/// payload that runs past EOF, or whose checksum doesn't match -- both are
/// treated as a torn trailing write rather than a hard error.
fn read_frames(path: &std::path::Path) -> anyhow::Result<Vec<StateLogItem>> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut items = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset + 8 > buf.len() {
            break;
        }
        let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(buf[offset + 4..offset + 8].try_into().unwrap());
        let payload_start = offset + 8;
        let payload_end = payload_start + len;
        if payload_end > buf.len() {
            break;
        }
        let payload = &buf[payload_start..payload_end];
        if crc32c::crc32c(payload) != checksum {
            break;
        }
        let (item, _): (StateLogItem, usize) =
            match bincode::serde::decode_from_slice(payload, BINCODE_CONFIG) {
                Ok(decoded) => decoded,
                Err(_) => break,
            };
        items.push(item);
        offset = payload_end;
    }
    Ok(items)
}

/// Keeps only the latest `StageInfo` per stage, at most one `StageCorruption`
/// per stage, and at most one `AppDeletion` per app; every `TaskAttemptCommit`
/// survives since each carries incremental commit history.
fn compact(items: &[StateLogItem]) -> Vec<StateLogItem> {
    use std::collections::HashSet;

    let mut latest_stage_info: std::collections::HashMap<AppShuffleId, usize> = Default::default();
    let mut seen_corruption: HashSet<AppShuffleId> = Default::default();
    let mut seen_deletion: HashSet<AppId> = Default::default();

    for (idx, item) in items.iter().enumerate() {
        if let StateLogItem::StageInfo { app_shuffle_id, .. } = item {
            latest_stage_info.insert(app_shuffle_id.clone(), idx);
        }
    }

    let mut compacted = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match item {
            StateLogItem::StageInfo { app_shuffle_id, .. } => {
                if latest_stage_info.get(app_shuffle_id) == Some(&idx) {
                    compacted.push(item.clone());
                }
            }
            StateLogItem::StageCorruption { app_shuffle_id } => {
                if seen_corruption.insert(app_shuffle_id.clone()) {
                    compacted.push(item.clone());
                }
            }
            StateLogItem::AppDeletion { app_id } => {
                if seen_deletion.insert(app_id.clone()) {
                    compacted.push(item.clone());
                }
            }
            StateLogItem::TaskAttemptCommit { .. } => compacted.push(item.clone()),
        }
    }
    compacted
}
