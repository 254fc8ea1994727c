use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::CommitStore;
use crate::types::Partition;

/// Commit state kept in process memory. Survives a `ConsumerLoop` restart as
/// long as the same instance is reused.
#[derive(Default)]
pub struct MemoryCommitStore {
    offsets: Mutex<HashMap<Partition, i64>>,
}

impl MemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<Partition, i64> {
        match self.offsets.lock() {
            Ok(offsets) => offsets.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl CommitStore for MemoryCommitStore {
    async fn get(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        let offsets = self
            .offsets
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned memory store".to_owned()))?;
        Ok(offsets.get(partition).copied())
    }

    async fn put(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned memory store".to_owned()))?;
        offsets.insert(partition.clone(), offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_last_put() {
        let store = MemoryCommitStore::new();
        let partition = Partition::new("t", 0);

        assert_eq!(store.get(&partition).await.unwrap(), None);

        store.put(&partition, 4).await.unwrap();
        store.put(&partition, 7).await.unwrap();

        assert_eq!(store.get(&partition).await.unwrap(), Some(7));
        assert_eq!(store.snapshot().len(), 1);
    }
}
