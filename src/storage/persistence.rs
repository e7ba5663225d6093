//! Filesystem snapshot store: one `<id>.snap` file per entity.

use super::SnapshotStore;
use crate::core::{EntityId, Result, StateError};
use async_trait::async_trait;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::task;
use tracing::{Level, event};

pub const SNAPSHOT_EXTENSION: &str = "snap";

pub struct FsSnapshotStore {
    root_dir: PathBuf,
    fsync: bool,
}

impl FsSnapshotStore {
    /// Opens (and creates if needed) the snapshot directory.
    pub fn open<P: AsRef<Path>>(root_dir: P, fsync: bool) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).map_err(|e| {
            StateError::IoError(format!(
                "Failed to create snapshot directory '{}': {}",
                root_dir.display(),
                e
            ))
        })?;
        Ok(Self { root_dir, fsync })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn snapshot_path(&self, id: &EntityId) -> PathBuf {
        self.root_dir.join(format!("{}.{}", id, SNAPSHOT_EXTENSION))
    }
}

/// Writes through a temp file in the same directory and renames it over the target.
///
/// Temp names are unique, so concurrent writers never share a scratch file.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8], fsync: bool) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    if fsync {
        tmp.as_file().sync_all()?;
    }
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn read(&self, id: &EntityId) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.snapshot_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::IoError(format!(
                "Failed to read snapshot for '{}': {}",
                id, e
            ))),
        }
    }

    async fn write(&self, id: &EntityId, bytes: Vec<u8>) -> Result<()> {
        let dir = self.root_dir.clone();
        let target = self.snapshot_path(id);
        let fsync = self.fsync;
        task::spawn_blocking(move || write_atomic(&dir, &target, &bytes, fsync))
            .await
            .map_err(|e| StateError::WriteError(id.to_string(), format!("writer task: {}", e)))?
            .map_err(|e| StateError::WriteError(id.to_string(), e.to_string()))
    }

    async fn remove(&self, id: &EntityId) -> Result<bool> {
        match tokio::fs::remove_file(self.snapshot_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::IoError(format!(
                "Failed to remove snapshot for '{}': {}",
                id, e
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<EntityId>> {
        let mut dir = tokio::fs::read_dir(&self.root_dir).await?;
        let mut ids = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match stem.parse::<EntityId>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    event!(Level::DEBUG, path = %path.display(), "ignoring foreign snapshot file");
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn quarantine(&self, id: &EntityId) -> Result<()> {
        let source = self.snapshot_path(id);
        let target = self.root_dir.join(format!(
            "{}.{}.corrupt-{}",
            id,
            SNAPSHOT_EXTENSION,
            Utc::now().timestamp_millis()
        ));
        match tokio::fs::rename(&source, &target).await {
            Ok(()) => {
                event!(Level::WARN, entity_id = %id, target = %target.display(), "quarantined unreadable snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::IoError(format!(
                "Failed to quarantine snapshot for '{}': {}",
                id, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::open(temp_dir.path(), true).unwrap();
        let id = EntityId::new_random();

        assert_eq!(store.read(&id).await.unwrap(), None);
        store.write(&id, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), Some(vec![1, 2, 3]));
        assert!(store.snapshot_path(&id).exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_unit() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::open(temp_dir.path(), false).unwrap();
        let id = EntityId::new_random();

        store.write(&id, vec![1; 64]).await.unwrap();
        store.write(&id, vec![2; 8]).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), Some(vec![2; 8]));
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::open(temp_dir.path(), false).unwrap();
        let a = EntityId::new_random();
        let b = EntityId::new_random();
        store.write(&a, vec![0]).await.unwrap();
        store.write(&b, vec![0]).await.unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(temp_dir.path().join("garbage.snap"), b"x").unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_remove_and_quarantine() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsSnapshotStore::open(temp_dir.path(), false).unwrap();
        let id = EntityId::new_random();

        assert!(!store.remove(&id).await.unwrap());
        store.write(&id, vec![9]).await.unwrap();
        store.quarantine(&id).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap(), None);
        let leftovers = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);

        store.write(&id, vec![9]).await.unwrap();
        assert!(store.remove(&id).await.unwrap());
        assert_eq!(store.read(&id).await.unwrap(), None);
    }
}
