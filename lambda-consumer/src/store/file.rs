use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::CommitStore;
use crate::types::Partition;

/// `{topic: {partition: offset}}`
type CommitFile = BTreeMap<String, BTreeMap<i32, i64>>;

/// Commit state persisted as a JSON document on local disk.
///
/// Every `put` rewrites the whole document into a sibling temporary file,
/// syncs it, renames it over the previous one and syncs the directory. A crash
/// leaves either the old or the new state behind, never a partial write.
pub struct FileCommitStore {
    path: PathBuf,
    state: Mutex<CommitFile>,
}

impl FileCommitStore {
    /// Open the store at `path`, starting empty if the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CommitFile>(&bytes).map_err(|e| {
                StoreError::Corrupt(format!("failed to parse {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No commit file found, starting empty");
                CommitFile::new()
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Directory holding the commit file, fsynced so the rename itself is durable.
    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    async fn write(&self, state: &CommitFile) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Corrupt(format!("failed to serialize commit state: {e}")))?;

        let temporary = self.temporary_path();
        let unavailable = |action: &str, path: &Path, e: std::io::Error| {
            StoreError::Unavailable(format!("failed to {action} {}: {e}", path.display()))
        };

        // The data must be on disk before the rename makes it visible
        let mut file = File::create(&temporary)
            .await
            .map_err(|e| unavailable("create", &temporary, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| unavailable("write", &temporary, e))?;
        file.sync_all()
            .await
            .map_err(|e| unavailable("sync", &temporary, e))?;
        drop(file);

        tokio::fs::rename(&temporary, &self.path)
            .await
            .map_err(|e| unavailable("replace", &self.path, e))?;

        let directory = self.directory();
        File::open(directory)
            .await
            .map_err(|e| unavailable("open", directory, e))?
            .sync_all()
            .await
            .map_err(|e| unavailable("sync", directory, e))
    }
}

#[async_trait]
impl CommitStore for FileCommitStore {
    async fn get(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .get(partition.topic())
            .and_then(|partitions| partitions.get(&partition.partition_number()))
            .copied())
    }

    async fn put(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        let mut updated = state.clone();
        updated
            .entry(partition.topic().to_owned())
            .or_default()
            .insert(partition.partition_number(), offset);

        // Only keep the new state in memory once it is on disk
        self.write(&updated).await?;
        *state = updated;

        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Wrote commit file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        let p0 = Partition::new("lambda-topic", 0);
        let p1 = Partition::new("lambda-topic", 1);

        let store = FileCommitStore::open(&path).await.unwrap();
        assert_eq!(store.get(&p0).await.unwrap(), None);
        store.put(&p0, 5).await.unwrap();
        store.put(&p1, 12).await.unwrap();
        store.put(&p0, 6).await.unwrap();
        drop(store);

        let reopened = FileCommitStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&p0).await.unwrap(), Some(6));
        assert_eq!(reopened.get(&p1).await.unwrap(), Some(12));
        assert!(!reopened.temporary_path().exists());
    }

    #[tokio::test]
    async fn test_put_replaces_content_and_leftover_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        let partition = Partition::new("lambda-topic", 3);

        let store = FileCommitStore::open(&path).await.unwrap();
        // A write interrupted before its rename leaves a partial temporary file
        std::fs::write(store.temporary_path(), b"{\"lambda-topic\": {\"3\": 9").unwrap();

        store.put(&partition, 7).await.unwrap();

        assert!(!store.temporary_path().exists());
        let on_disk: CommitFile = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk["lambda-topic"][&3], 7);
    }

    #[tokio::test]
    async fn test_relative_path_syncs_current_directory() {
        let store = FileCommitStore {
            path: PathBuf::from("offsets.json"),
            state: Mutex::new(CommitFile::new()),
        };

        assert_eq!(store.directory(), Path::new("."));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = FileCommitStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("offsets.json");
        let partition = Partition::new("lambda-topic", 0);

        let store = FileCommitStore::open(&path).await.unwrap();
        let result = store.put(&partition, 3).await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.get(&partition).await.unwrap(), None);
    }
}
