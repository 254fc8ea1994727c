use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, StartPosition};
use crate::error::FetchError;
use crate::kafka::is_fatal_error;
use crate::message::InboundMessage;
use crate::types::Partition;

fn fetch_error(error: KafkaError) -> FetchError {
    if is_fatal_error(&error) {
        FetchError::Fatal(error.to_string())
    } else {
        FetchError::Transient(error.to_string())
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    let value = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
    let mut inbound =
        InboundMessage::new(message.topic(), message.partition(), message.offset(), value);

    if let Some(key) = message.key() {
        inbound = inbound.with_key(key.to_vec());
    }
    if let Some(timestamp) = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        inbound = inbound.with_timestamp(timestamp);
    }
    inbound
}

/// An assign-only consumer dedicated to one partition.
struct PartitionReader {
    topic: String,
    partition: i32,
    consumer: BaseConsumer,
    /// Used when reading starts without a committed offset
    start: Offset,
    assigned: bool,
    /// Offset the consumer will return next, when known
    position: Option<i64>,
}

impl PartitionReader {
    fn position_at(&mut self, offset: Offset) -> Result<(), FetchError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, offset)
            .map_err(fetch_error)?;
        self.consumer.assign(&tpl).map_err(fetch_error)?;
        self.assigned = true;
        self.position = match offset {
            Offset::Offset(next) => Some(next),
            _ => None,
        };

        debug!(
            topic = self.topic.as_str(),
            partition = self.partition,
            offset = ?offset,
            "Positioned partition reader"
        );
        Ok(())
    }

    /// Blocking poll of up to `max_batch` messages. Only the first message is
    /// waited for; the rest of the batch is whatever is already buffered.
    fn poll_batch(
        &mut self,
        from_offset: Option<i64>,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, FetchError> {
        match from_offset {
            Some(offset) if self.position != Some(offset) => {
                self.position_at(Offset::Offset(offset))?
            }
            // Nothing committed: keep reading from the start position
            None if !self.assigned => self.position_at(self.start)?,
            _ => {}
        }

        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max_batch {
            let wait = if batch.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match self.consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => batch.push(to_inbound(&message)),
                Some(Err(e)) if batch.is_empty() => return Err(fetch_error(e)),
                Some(Err(e)) => {
                    warn!(
                        topic = self.topic.as_str(),
                        partition = self.partition,
                        error = %e,
                        "Poll error after a partial batch, returning what was read"
                    );
                    break;
                }
            }
        }

        if let Some(last) = batch.last() {
            self.position = Some(last.offset() + 1);
        }
        Ok(batch)
    }
}

/// `BrokerClient` backed by Kafka.
///
/// Assignment covers every partition of the topic, from the broker metadata.
/// Each partition is read by its own consumer so that one partition blocking
/// in a poll never delays another. Polls run on the blocking thread pool.
/// Partitions without a committed offset start at `start_position`.
pub struct KafkaBroker {
    client_config: ClientConfig,
    metadata_consumer: Arc<BaseConsumer>,
    metadata_timeout: Duration,
    start_position: StartPosition,
    readers: DashMap<i32, Arc<Mutex<PartitionReader>>>,
}

impl KafkaBroker {
    pub fn new(
        client_config: ClientConfig,
        metadata_timeout: Duration,
        start_position: StartPosition,
    ) -> Result<Self, KafkaError> {
        let metadata_consumer: BaseConsumer = client_config.create()?;

        Ok(Self {
            client_config,
            metadata_consumer: Arc::new(metadata_consumer),
            metadata_timeout,
            start_position,
            readers: DashMap::new(),
        })
    }

    fn start_offset(&self) -> Offset {
        match self.start_position {
            StartPosition::Earliest => Offset::Beginning,
            StartPosition::Latest => Offset::End,
        }
    }

    fn partitions_from_metadata(
        consumer: &BaseConsumer,
        topic: &str,
        timeout: Duration,
    ) -> Result<Vec<i32>, FetchError> {
        let metadata = consumer
            .fetch_metadata(Some(topic), timeout)
            .map_err(fetch_error)?;

        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| FetchError::Transient(format!("no metadata returned for {topic}")))?;

        if let Some(error) = topic_metadata.error() {
            let code = RDKafkaErrorCode::from(error);
            return Err(match code {
                RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic => {
                    FetchError::Fatal(format!("topic {topic} does not exist"))
                }
                _ => FetchError::Transient(format!("metadata error for {topic}: {code}")),
            });
        }

        let mut partitions: Vec<i32> = topic_metadata.partitions().iter().map(|p| p.id()).collect();
        partitions.sort_unstable();
        Ok(partitions)
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn assign(&self, topic: &str) -> Result<Vec<i32>, FetchError> {
        let consumer = self.metadata_consumer.clone();
        let owned_topic = topic.to_owned();
        let timeout = self.metadata_timeout;

        let partitions = tokio::task::spawn_blocking(move || {
            Self::partitions_from_metadata(&consumer, &owned_topic, timeout)
        })
        .await
        .map_err(|e| FetchError::Transient(format!("metadata task failed: {e}")))??;

        for &partition in &partitions {
            if self.readers.contains_key(&partition) {
                continue;
            }
            let consumer: BaseConsumer = self.client_config.create().map_err(fetch_error)?;
            self.readers.insert(
                partition,
                Arc::new(Mutex::new(PartitionReader {
                    topic: topic.to_owned(),
                    partition,
                    consumer,
                    start: self.start_offset(),
                    assigned: false,
                    position: None,
                })),
            );
        }

        info!(topic = topic, partitions = ?partitions, "Created partition readers");
        Ok(partitions)
    }

    async fn fetch(
        &self,
        partition: &Partition,
        from_offset: Option<i64>,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, FetchError> {
        let reader = self
            .readers
            .get(&partition.partition_number())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| FetchError::Fatal(format!("partition {partition} is not assigned")))?;

        tokio::task::spawn_blocking(move || {
            let mut reader = reader
                .lock()
                .map_err(|_| FetchError::Fatal("partition reader lock poisoned".to_owned()))?;
            reader.poll_batch(from_offset, max_batch, timeout)
        })
        .await
        .map_err(|e| FetchError::Transient(format!("fetch task failed: {e}")))?
    }
}
