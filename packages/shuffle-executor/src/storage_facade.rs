//! Thin trait over the filesystem that `PartitionWriter` and the expiry path
//! depend on. The on-disk layout under a stage's directory is opaque at this
//! layer; callers only ever see paths they themselves constructed.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Pluggable backing store for partition files and per-application
/// directories. Implementations: real filesystem (production), in-memory
/// (tests).
///
/// `open_append` returns a blocking [`std::fs::File`] rather than an async
/// handle: `PartitionWriter` does its actual syscalls inside
/// `spawn_blocking`, so the facade hands over a handle meant to be used from
/// a blocking context, not awaited directly.
#[async_trait]
pub trait StorageFacade: Send + Sync {
    /// Opens (creating parent directories as needed) an append-mode file
    /// handle for a partition writer.
    async fn open_append(&self, path: &Path) -> anyhow::Result<File>;

    /// Recursively removes a directory tree. Missing directories are not an
    /// error -- expiry may race with a prior partial cleanup.
    async fn delete_directory(&self, path: &Path) -> anyhow::Result<()>;

    /// Builds the path for one partition file of one stage, rooted under
    /// this facade's base directory. The naming scheme is opaque outside
    /// this module -- callers only ever round-trip the returned path.
    fn partition_path(&self, app_id: &str, shuffle_id: i32, partition_id: i32, file_index: i32) -> PathBuf;
}

/// Production [`StorageFacade`] backed by the real filesystem, rooted at
/// `ExecutorConfig::root_dir`.
#[derive(Debug, Clone)]
pub struct FsStorageFacade {
    root_dir: PathBuf,
}

impl FsStorageFacade {
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }
}

#[async_trait]
impl StorageFacade for FsStorageFacade {
    async fn open_append(&self, path: &Path) -> anyhow::Result<File> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().create(true).append(true).open(path)
        })
        .await??;
        Ok(file)
    }

    async fn delete_directory(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn partition_path(&self, app_id: &str, shuffle_id: i32, partition_id: i32, file_index: i32) -> PathBuf {
        self.root_dir
            .join(app_id)
            .join(format!("shuffle-{shuffle_id}"))
            .join(format!("part-{partition_id}-{file_index}.data"))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn open_append_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let facade = FsStorageFacade::new(dir.path());
        let path = facade.partition_path("app-1", 0, 2, 0);

        let mut file = facade.open_append(&path).await.unwrap();
        file.write_all(b"hello").unwrap();
        file.sync_data().unwrap();

        assert!(path.exists());
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn delete_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let facade = FsStorageFacade::new(dir.path());
        let app_dir = dir.path().join("app-1");
        tokio::fs::create_dir_all(&app_dir).await.unwrap();

        facade.delete_directory(&app_dir).await.unwrap();
        assert!(!app_dir.exists());

        // Second call on an already-missing directory must not error.
        facade.delete_directory(&app_dir).await.unwrap();
    }

    #[test]
    fn partition_path_is_deterministic() {
        let facade = FsStorageFacade::new("/tmp/root");
        let p1 = facade.partition_path("app-1", 2, 0, 3);
        let p2 = facade.partition_path("app-1", 2, 0, 3);
        assert_eq!(p1, p2);
        assert!(p1.starts_with("/tmp/root/app-1/shuffle-2"));
    }
}
