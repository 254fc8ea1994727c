//! Durable storage for the committed offset of each partition.
//!
//! The stored value is the offset of the last message that was handled (or
//! skipped), so consumption resumes at `stored + 1`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::Partition;

pub mod file;
pub mod memory;

pub use file::FileCommitStore;
pub use memory::MemoryCommitStore;

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// The last committed offset of a partition, `None` if nothing was committed yet.
    async fn get(&self, partition: &Partition) -> Result<Option<i64>, StoreError>;

    /// Persist `offset` as the last committed offset of a partition.
    async fn put(&self, partition: &Partition, offset: i64) -> Result<(), StoreError>;
}
