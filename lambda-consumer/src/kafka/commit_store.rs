use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use crate::error::StoreError;
use crate::store::CommitStore;
use crate::types::Partition;

/// Commit state kept as the consumer group's committed offsets in Kafka.
///
/// Kafka stores the next offset to consume, so the last processed offset is
/// written as `offset + 1` and read back as `committed - 1`.
pub struct KafkaCommitStore {
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaCommitStore {
    pub fn new(client_config: &ClientConfig, timeout: Duration) -> Result<Self, KafkaError> {
        let consumer: BaseConsumer = client_config.create()?;
        Ok(Self {
            consumer: Arc::new(consumer),
            timeout,
        })
    }
}

fn unavailable(error: KafkaError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

#[async_trait]
impl CommitStore for KafkaCommitStore {
    async fn get(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        let consumer = self.consumer.clone();
        let partition = partition.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition(partition.topic(), partition.partition_number());

            let committed = consumer
                .committed_offsets(tpl, timeout)
                .map_err(unavailable)?;

            let last_processed = committed
                .find_partition(partition.topic(), partition.partition_number())
                .and_then(|elem| match elem.offset() {
                    Offset::Offset(next) if next > 0 => Some(next - 1),
                    _ => None,
                });
            Ok(last_processed)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("commit lookup task failed: {e}")))?
    }

    async fn put(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        let consumer = self.consumer.clone();
        let partition = partition.clone();

        tokio::task::spawn_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset + 1),
            )
            .map_err(unavailable)?;

            consumer.commit(&tpl, CommitMode::Sync).map_err(unavailable)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }
}
