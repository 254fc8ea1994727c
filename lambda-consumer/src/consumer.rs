use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::error::{ConsumerError, FetchError, StoreError};
use crate::handler::MessageHandler;
use crate::metrics_consts::{ACTIVE_PARTITION_WORKERS, CONSUMER_STATE};
use crate::offset_tracker::OffsetTracker;
use crate::partition_worker::{PartitionOutcome, PartitionWorker};
use crate::retry::RetryPolicy;
use crate::types::Partition;

/// Settings of a `ConsumerLoop`, fixed for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    /// Longest a single fetch waits for new messages
    pub poll_timeout: Duration,
    pub max_batch_size: usize,
    pub retry_policy: RetryPolicy,
    /// How long a partition waits for an unavailable commit store before halting
    pub store_unavailable_timeout: Duration,
    /// Bound on the whole Starting phase
    pub startup_deadline: Duration,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            poll_timeout: Duration::from_secs(1),
            max_batch_size: 100,
            retry_policy: RetryPolicy::default(),
            store_unavailable_timeout: Duration::from_secs(60),
            startup_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_store_unavailable_timeout(mut self, timeout: Duration) -> Self {
        self.store_unavailable_timeout = timeout;
        self
    }

    pub fn with_startup_deadline(mut self, deadline: Duration) -> Self {
        self.startup_deadline = deadline;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl ConsumerState {
    fn as_gauge(self) -> f64 {
        match self {
            ConsumerState::Starting => 0.0,
            ConsumerState::Running => 1.0,
            ConsumerState::Draining => 2.0,
            ConsumerState::Stopped => 3.0,
        }
    }
}

/// Final result of a consumer run, one outcome per assigned partition.
#[derive(Debug, Clone, Default)]
pub struct ConsumerReport {
    pub partitions: BTreeMap<i32, PartitionOutcome>,
    /// Whether the run ended because shutdown was requested
    pub shutdown_requested: bool,
}

impl ConsumerReport {
    pub fn outcome(&self, partition: i32) -> Option<&PartitionOutcome> {
        self.partitions.get(&partition)
    }

    pub fn halted(&self) -> impl Iterator<Item = (i32, &PartitionOutcome)> {
        self.partitions
            .iter()
            .filter(|(_, outcome)| outcome.is_halted())
            .map(|(partition, outcome)| (*partition, outcome))
    }

    /// True when the run ended on its own because no partition was left consuming.
    pub fn all_halted(&self) -> bool {
        !self.shutdown_requested
            && !self.partitions.is_empty()
            && self.partitions.values().all(PartitionOutcome::is_halted)
    }
}

/// Consumes one topic: one `PartitionWorker` per assigned partition, each
/// fetching from the broker, handing messages to the handler and committing
/// them through the offset tracker.
///
/// The loop moves through Starting, Running, Draining and Stopped. Draining
/// starts when the shutdown token is cancelled; workers finish the message in
/// flight and stop.
pub struct ConsumerLoop<B, H> {
    config: Arc<ConsumerConfig>,
    broker: Arc<B>,
    handler: Arc<H>,
    offset_tracker: Arc<OffsetTracker>,
    state: watch::Sender<ConsumerState>,
}

impl<B, H> ConsumerLoop<B, H>
where
    B: BrokerClient + 'static,
    H: MessageHandler + 'static,
{
    pub fn new(
        config: ConsumerConfig,
        broker: Arc<B>,
        handler: Arc<H>,
        offset_tracker: Arc<OffsetTracker>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            config: Arc::new(config),
            broker,
            handler,
            offset_tracker,
            state,
        }
    }

    /// Follow the lifecycle state, e.g. for readiness probes.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until shutdown is requested and every worker drained, or until
    /// every partition halted. Fails only if the consumer could not start.
    /// Shutdown during startup stops at once with an empty report.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ConsumerReport, ConsumerError> {
        self.set_state(ConsumerState::Starting);

        let deadline = self.config.startup_deadline;
        let started = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            started = tokio::time::timeout(deadline, self.start()) => Some(started),
        };
        let assignments = match started {
            None => {
                info!("Shutdown requested while starting");
                self.set_state(ConsumerState::Stopped);
                return Ok(ConsumerReport {
                    shutdown_requested: true,
                    ..ConsumerReport::default()
                });
            }
            Some(Ok(Ok(assignments))) => assignments,
            Some(Ok(Err(e))) => {
                error!(error = %e, "Consumer failed to start");
                self.set_state(ConsumerState::Stopped);
                return Err(e);
            }
            Some(Err(_)) => {
                error!(deadline = ?deadline, "Consumer did not start in time");
                self.set_state(ConsumerState::Stopped);
                return Err(ConsumerError::StartupTimeout(deadline));
            }
        };

        let mut workers = JoinSet::new();
        for (partition, resume_offset) in assignments {
            let number = partition.partition_number();
            let worker = PartitionWorker::new(
                partition,
                resume_offset,
                self.broker.clone(),
                self.handler.clone(),
                self.offset_tracker.clone(),
                self.config.clone(),
                shutdown.clone(),
            );
            workers.spawn(async move { (number, worker.run().await) });
        }
        metrics::gauge!(ACTIVE_PARTITION_WORKERS).set(workers.len() as f64);

        self.set_state(ConsumerState::Running);

        let mut report = ConsumerReport::default();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !report.shutdown_requested => {
                    report.shutdown_requested = true;
                    self.set_state(ConsumerState::Draining);
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok((partition, outcome))) => {
                        report.partitions.insert(partition, outcome);
                        metrics::gauge!(ACTIVE_PARTITION_WORKERS).set(workers.len() as f64);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Partition worker task failed");
                    }
                },
            }
        }

        let halted = report.halted().count();
        if halted > 0 {
            warn!(
                topic = self.config.topic.as_str(),
                halted_partitions = halted,
                "Consumer stopped with halted partitions"
            );
        }
        self.set_state(ConsumerState::Stopped);
        Ok(report)
    }

    /// Assign partitions and load their committed offsets. Transient failures
    /// are retried until the caller's startup deadline cuts this short.
    async fn start(&self) -> Result<Vec<(Partition, Option<i64>)>, ConsumerError> {
        let topic = self.config.topic.as_str();
        let policy = &self.config.retry_policy;

        let mut attempt = 0;
        let partitions = loop {
            match self.broker.assign(topic).await {
                Ok(partitions) => break partitions,
                Err(FetchError::Transient(reason)) => {
                    let delay = policy.time_until_next_retry(attempt);
                    attempt += 1;
                    warn!(
                        topic = topic,
                        attempt = attempt,
                        error = %reason,
                        "Partition assignment failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(ConsumerError::Assignment {
                        topic: topic.to_owned(),
                        source,
                    })
                }
            }
        };

        if partitions.is_empty() {
            return Err(ConsumerError::NoPartitions(topic.to_owned()));
        }

        let mut assignments = Vec::with_capacity(partitions.len());
        for number in partitions {
            let partition = Partition::new(topic, number);
            let mut attempt = 0;
            let last_committed = loop {
                match self.offset_tracker.load(&partition).await {
                    Ok(last_committed) => break last_committed,
                    // Corrupt state will not fix itself
                    Err(source @ StoreError::Corrupt(_)) => {
                        return Err(ConsumerError::LoadOffsets { partition, source })
                    }
                    Err(e) => {
                        let delay = policy.time_until_next_retry(attempt);
                        attempt += 1;
                        warn!(
                            topic = topic,
                            partition = number,
                            attempt = attempt,
                            error = %e,
                            "Loading committed offset failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            };

            let resume_offset = last_committed.map(|offset| offset + 1);
            assignments.push((partition, resume_offset));
        }

        info!(
            topic = topic,
            group_id = self.config.group_id.as_str(),
            partitions = ?assignments,
            "Partitions assigned"
        );
        Ok(assignments)
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        metrics::gauge!(CONSUMER_STATE).set(state.as_gauge());
        if previous != state {
            info!(from = ?previous, to = ?state, "Consumer state changed");
        }
    }
}
