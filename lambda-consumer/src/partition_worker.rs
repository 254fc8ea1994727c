//! Partition Worker - Dedicated worker consuming a single partition
//!
//! Each assigned partition gets its own worker task, ensuring:
//! 1. Messages of a partition are handled one at a time, in offset order
//! 2. Partitions make progress independently of each other
//! 3. A failing partition halts alone, the others keep consuming

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerClient;
use crate::consumer::ConsumerConfig;
use crate::error::{FetchError, HaltReason};
use crate::handler::MessageHandler;
use crate::message::{InboundMessage, ProcessingResult};
use crate::metrics_consts::{
    FETCH_ERRORS, HANDLER_RETRIES, MESSAGES_FETCHED, MESSAGES_PROCESSED,
    MESSAGES_REDELIVERED, MESSAGES_SKIPPED, MESSAGE_PROCESSING_DURATION, PARTITIONS_HALTED,
};
use crate::offset_tracker::OffsetTracker;
use crate::retry::ExhaustedRetryPolicy;
use crate::types::Partition;

/// How a partition worker finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Stopped on shutdown. `last_committed` is where the next start resumes from.
    Drained { last_committed: Option<i64> },
    /// Stopped consuming at `offset`, which was not committed. `None` when the
    /// partition halted before its first message was known.
    Halted {
        offset: Option<i64>,
        reason: HaltReason,
    },
}

impl PartitionOutcome {
    pub fn is_halted(&self) -> bool {
        matches!(self, PartitionOutcome::Halted { .. })
    }
}

/// What to do with a message once the handler is done with it
enum Disposition {
    Commit,
    Halt(HaltReason),
    /// Shutdown interrupted a retry backoff, leave the message for redelivery
    Abandon,
}

pub struct PartitionWorker<B, H> {
    partition: Partition,
    broker: Arc<B>,
    handler: Arc<H>,
    offset_tracker: Arc<OffsetTracker>,
    config: Arc<ConsumerConfig>,
    shutdown: CancellationToken,
    /// Offset of the next message to hand to the handler, `None` until the
    /// first message of a partition without committed offset arrives
    next_offset: Option<i64>,
}

impl<B, H> PartitionWorker<B, H>
where
    B: BrokerClient + 'static,
    H: MessageHandler + 'static,
{
    pub fn new(
        partition: Partition,
        resume_offset: Option<i64>,
        broker: Arc<B>,
        handler: Arc<H>,
        offset_tracker: Arc<OffsetTracker>,
        config: Arc<ConsumerConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            partition,
            broker,
            handler,
            offset_tracker,
            config,
            shutdown,
            next_offset: resume_offset,
        }
    }

    /// The main worker loop. Returns once shutdown is requested or the
    /// partition halts.
    pub async fn run(mut self) -> PartitionOutcome {
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            resume_offset = ?self.next_offset,
            "Starting partition worker"
        );

        let outcome = 'consume: loop {
            if self.shutdown.is_cancelled() {
                break self.drained();
            }

            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.fetch_with_retry() => Some(result),
            };
            let batch = match fetched {
                None => break self.drained(),
                Some(Ok(batch)) => batch,
                Some(Err(reason)) => break self.halt(reason, None),
            };

            if !batch.is_empty() {
                metrics::counter!(
                    MESSAGES_FETCHED,
                    "partition" => self.partition.partition_number().to_string()
                )
                .increment(batch.len() as u64);
            }

            for message in batch {
                // Shutdown is only honoured between messages
                if self.shutdown.is_cancelled() {
                    break 'consume self.drained();
                }

                // Without a committed offset the first message sets the position
                let next_offset = self.next_offset.unwrap_or(message.offset());
                if message.offset() < next_offset {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        offset = message.offset(),
                        next_offset = next_offset,
                        "Dropping message below the resume offset"
                    );
                    metrics::counter!(
                        MESSAGES_REDELIVERED,
                        "partition" => self.partition.partition_number().to_string()
                    )
                    .increment(1);
                    continue;
                }

                match self.process(&message).await {
                    Disposition::Commit => {
                        if let Err(reason) = self.commit(&message).await {
                            break 'consume self.halt(reason, Some(&message));
                        }
                    }
                    Disposition::Halt(reason) => break 'consume self.halt(reason, Some(&message)),
                    Disposition::Abandon => break 'consume self.drained(),
                }

                self.next_offset = Some(message.offset() + 1);
            }
        };

        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            outcome = ?outcome,
            "Partition worker stopped"
        );
        outcome
    }

    /// Fetch the next batch, retrying transient broker errors with backoff.
    async fn fetch_with_retry(&self) -> Result<Vec<InboundMessage>, HaltReason> {
        let policy = &self.config.retry_policy;
        let mut attempt = 0;

        loop {
            let fetched = self
                .broker
                .fetch(
                    &self.partition,
                    self.next_offset,
                    self.config.max_batch_size,
                    self.config.poll_timeout,
                )
                .await;

            match fetched {
                Ok(batch) => return Ok(batch),
                Err(FetchError::Fatal(reason)) => return Err(HaltReason::FetchFatal(reason)),
                Err(FetchError::Transient(reason)) => {
                    let delay = policy.time_until_next_retry(attempt);
                    attempt = attempt.saturating_add(1);

                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        offset = ?self.next_offset,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Fetch failed, retrying"
                    );
                    metrics::counter!(
                        FETCH_ERRORS,
                        "partition" => self.partition.partition_number().to_string()
                    )
                    .increment(1);

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Hand a message to the handler, retrying `Retryable` results per policy.
    async fn process(&self, message: &InboundMessage) -> Disposition {
        let policy = &self.config.retry_policy;
        let mut retries = 0;

        loop {
            let result = self.invoke(message).await;
            metrics::counter!(
                MESSAGES_PROCESSED,
                "partition" => self.partition.partition_number().to_string(),
                "result" => result.result_type()
            )
            .increment(1);

            let reason = match result {
                ProcessingResult::Success => return Disposition::Commit,
                ProcessingResult::Fatal(reason) => {
                    return Disposition::Halt(HaltReason::HandlerFatal(reason))
                }
                ProcessingResult::Retryable(reason) => reason,
            };

            if retries >= policy.max_retries() {
                return match policy.exhausted_policy() {
                    ExhaustedRetryPolicy::SkipAndLog => {
                        warn!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition_number(),
                            offset = message.offset(),
                            digest = %message.digest(),
                            retries = retries,
                            reason = %reason,
                            "Retries exhausted, skipping message"
                        );
                        metrics::counter!(
                            MESSAGES_SKIPPED,
                            "partition" => self.partition.partition_number().to_string()
                        )
                        .increment(1);
                        Disposition::Commit
                    }
                    ExhaustedRetryPolicy::HaltPartition => {
                        Disposition::Halt(HaltReason::RetriesExhausted { retries, reason })
                    }
                };
            }

            let delay = policy.time_until_next_retry(retries);
            retries += 1;

            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = message.offset(),
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Handler failed, retrying message"
            );
            metrics::counter!(
                HANDLER_RETRIES,
                "partition" => self.partition.partition_number().to_string()
            )
            .increment(1);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        offset = message.offset(),
                        "Shutdown during retry backoff, leaving message uncommitted"
                    );
                    return Disposition::Abandon;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the handler once. A panic is reported as a fatal result.
    async fn invoke(&self, message: &InboundMessage) -> ProcessingResult {
        let started = Instant::now();

        let result = AssertUnwindSafe(self.handler.process(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                ProcessingResult::Fatal(format!("handler panicked: {}", panic_message(&*panic)))
            });

        metrics::histogram!(
            MESSAGE_PROCESSING_DURATION,
            "partition" => self.partition.partition_number().to_string()
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    /// Commit a handled message. An unavailable store holds the partition in
    /// place until it recovers or `store_unavailable_timeout` runs out. Not
    /// interrupted by shutdown, so a drained worker leaves nothing uncommitted.
    async fn commit(&self, message: &InboundMessage) -> Result<(), HaltReason> {
        let policy = &self.config.retry_policy;
        let deadline = self.config.store_unavailable_timeout;
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self
                .offset_tracker
                .record(&self.partition, message.offset())
                .await
            {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(HaltReason::StoreUnavailable(error));
            }

            let delay = policy
                .time_until_next_retry(attempt)
                .min(deadline.saturating_sub(elapsed))
                .max(Duration::from_millis(1));
            attempt = attempt.saturating_add(1);

            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = message.offset(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Commit store unavailable, holding partition"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn drained(&self) -> PartitionOutcome {
        PartitionOutcome::Drained {
            last_committed: self.offset_tracker.last_committed(&self.partition),
        }
    }

    fn halt(&self, reason: HaltReason, message: Option<&InboundMessage>) -> PartitionOutcome {
        let offset = message.map(InboundMessage::offset).or(self.next_offset);

        error!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = ?offset,
            digest = ?message.map(InboundMessage::digest),
            reason_type = reason.reason_type(),
            error = %reason,
            "Halting partition"
        );
        metrics::counter!(
            PARTITIONS_HALTED,
            "partition" => self.partition.partition_number().to_string(),
            "reason" => reason.reason_type()
        )
        .increment(1);

        PartitionOutcome::Halted { offset, reason }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}
