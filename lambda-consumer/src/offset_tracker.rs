//! Offset Tracker - Records the last durably processed offset per partition
//!
//! Offsets go through to the `CommitStore` before they are considered
//! committed, and a committed offset never moves backwards. Writes are
//! serialized per partition; partitions never wait on each other.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::metrics_consts::{PARTITION_COMMITTED_OFFSET, STORE_UNAVAILABLE};
use crate::store::CommitStore;
use crate::types::Partition;

pub struct OffsetTracker {
    store: Arc<dyn CommitStore>,
    /// Bound on every single store call
    op_timeout: Duration,
    /// Last offset known to be in the store
    committed: DashMap<Partition, i64>,
    /// One write lock per partition
    write_locks: DashMap<Partition, Arc<Mutex<()>>>,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn CommitStore>, op_timeout: Duration) -> Self {
        Self {
            store,
            op_timeout,
            committed: DashMap::new(),
            write_locks: DashMap::new(),
        }
    }

    /// Read the committed offset of a partition from the store. Used once per
    /// partition at startup to find the resume point.
    pub async fn load(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        let stored = self.with_timeout(self.store.get(partition)).await?;

        match stored {
            Some(offset) => {
                self.committed
                    .entry(partition.clone())
                    .and_modify(|current| *current = (*current).max(offset))
                    .or_insert(offset);
                self.report_committed(partition, offset);
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Loaded committed offset"
                );
            }
            None => info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "No committed offset found"
            ),
        }

        Ok(self.last_committed(partition))
    }

    /// Commit `offset` as processed for `partition`.
    ///
    /// Offsets at or below the current committed offset are accepted without
    /// touching the store. On error nothing is recorded and the caller must
    /// not move past `offset`.
    pub async fn record(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        let lock = self.write_lock(partition);
        let _guard = lock.lock().await;

        if let Some(current) = self.last_committed(partition) {
            if offset <= current {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    committed = current,
                    "Ignoring commit that does not advance the partition"
                );
                return Ok(());
            }
        }

        if let Err(e) = self.with_timeout(self.store.put(partition, offset)).await {
            metrics::counter!(
                STORE_UNAVAILABLE,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            return Err(e);
        }

        self.committed.insert(partition.clone(), offset);
        self.report_committed(partition, offset);
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = offset,
            "Committed offset"
        );
        Ok(())
    }

    /// The last offset committed through this tracker, or loaded at startup.
    pub fn last_committed(&self, partition: &Partition) -> Option<i64> {
        self.committed.get(partition).map(|entry| *entry.value())
    }

    pub fn partition_count(&self) -> usize {
        self.committed.len()
    }

    fn write_lock(&self, partition: &Partition) -> Arc<Mutex<()>> {
        // Clone the lock out so the map shard is not held while awaiting
        self.write_locks
            .entry(partition.clone())
            .or_default()
            .value()
            .clone()
    }

    async fn with_timeout<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::TimedOut(self.op_timeout)),
        }
    }

    fn report_committed(&self, partition: &Partition, offset: i64) {
        metrics::gauge!(
            PARTITION_COMMITTED_OFFSET,
            "topic" => partition.topic().to_string(),
            "partition" => partition.partition_number().to_string()
        )
        .set(offset as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCommitStore;
    use async_trait::async_trait;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic", num)
    }

    fn tracker_with(store: Arc<dyn CommitStore>) -> OffsetTracker {
        OffsetTracker::new(store, Duration::from_millis(500))
    }

    /// Store that never answers
    struct HangingStore;

    #[async_trait]
    impl CommitStore for HangingStore {
        async fn get(&self, _partition: &Partition) -> Result<Option<i64>, StoreError> {
            futures::future::pending().await
        }

        async fn put(&self, _partition: &Partition, _offset: i64) -> Result<(), StoreError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_record_goes_through_to_store() {
        let store = Arc::new(MemoryCommitStore::new());
        let tracker = tracker_with(store.clone());
        let partition = test_partition(0);

        tracker.record(&partition, 4).await.unwrap();

        assert_eq!(tracker.last_committed(&partition), Some(4));
        assert_eq!(store.get(&partition).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_record_never_goes_backwards() {
        let store = Arc::new(MemoryCommitStore::new());
        let tracker = tracker_with(store.clone());
        let partition = test_partition(0);

        tracker.record(&partition, 10).await.unwrap();
        tracker.record(&partition, 3).await.unwrap();
        tracker.record(&partition, 10).await.unwrap();

        assert_eq!(tracker.last_committed(&partition), Some(10));
        assert_eq!(store.get(&partition).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_load_reads_existing_offsets() {
        let store = Arc::new(MemoryCommitStore::new());
        store.put(&test_partition(1), 41).await.unwrap();
        let tracker = tracker_with(store);

        assert_eq!(tracker.load(&test_partition(0)).await.unwrap(), None);
        assert_eq!(tracker.load(&test_partition(1)).await.unwrap(), Some(41));
        assert_eq!(tracker.last_committed(&test_partition(1)), Some(41));
        assert_eq!(tracker.partition_count(), 1);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let tracker = tracker_with(Arc::new(MemoryCommitStore::new()));

        tracker.record(&test_partition(0), 100).await.unwrap();
        tracker.record(&test_partition(1), 5).await.unwrap();

        assert_eq!(tracker.last_committed(&test_partition(0)), Some(100));
        assert_eq!(tracker.last_committed(&test_partition(1)), Some(5));
        assert_eq!(tracker.last_committed(&test_partition(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out_as_unavailable() {
        let tracker = tracker_with(Arc::new(HangingStore));
        let partition = test_partition(0);

        let recorded = tracker.record(&partition, 1).await;
        assert_eq!(
            recorded,
            Err(StoreError::TimedOut(Duration::from_millis(500)))
        );
        assert_eq!(tracker.last_committed(&partition), None);

        let loaded = tracker.load(&partition).await;
        assert!(matches!(loaded, Err(StoreError::TimedOut(_))));
    }

    #[tokio::test]
    async fn test_concurrent_records_same_partition() {
        let store = Arc::new(MemoryCommitStore::new());
        let tracker = Arc::new(tracker_with(store.clone()));
        let partition = test_partition(0);

        let mut handles = vec![];
        for offset in 0..20 {
            let tracker = tracker.clone();
            let partition = partition.clone();
            handles.push(tokio::spawn(async move {
                tracker.record(&partition, offset).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The highest offset wins in the tracker and in the store
        assert_eq!(tracker.last_committed(&partition), Some(19));
        assert_eq!(store.get(&partition).await.unwrap(), Some(19));
    }
}
