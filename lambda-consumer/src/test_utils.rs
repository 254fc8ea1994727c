//! In-memory stand-ins for the broker, the commit store and the handler, so
//! the consumer loop can be driven without a Kafka cluster.
//!
//! All of them are plain library code. Tests share them through `Arc` and
//! inspect what happened afterwards.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerClient, StartPosition};
use crate::error::{FetchError, StoreError};
use crate::handler::MessageHandler;
use crate::message::{InboundMessage, ProcessingResult};
use crate::store::{CommitStore, MemoryCommitStore};
use crate::types::Partition;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct BrokerState {
    /// Messages per partition, indexed by offset
    partitions: BTreeMap<i32, Vec<InboundMessage>>,
    failing_fetches: HashMap<i32, u32>,
    fatal_fetches: HashMap<i32, String>,
    failing_assigns: u32,
    redeliver: HashSet<i32>,
    fetches: Vec<(i32, Option<i64>)>,
    /// Where a partition read without an offset starts, fixed on first read
    start_offsets: HashMap<i32, i64>,
}

/// A topic kept in memory. Offsets of a partition start at 0 and are dense.
pub struct InMemoryBroker {
    topic: String,
    start_position: StartPosition,
    unreachable: AtomicBool,
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            start_position: StartPosition::Earliest,
            unreachable: AtomicBool::new(false),
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Where fetches without an offset begin. `Latest` is the end of the
    /// partition at the time of that fetch.
    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Add a partition holding `count` messages valued `message-{offset}`.
    pub fn with_messages(self, partition: i32, count: i64) -> Self {
        self.add_partition(partition);
        for _ in 0..count {
            self.push(partition, None);
        }
        self
    }

    pub fn add_partition(&self, partition: i32) {
        lock(&self.state).partitions.entry(partition).or_default();
    }

    /// Append a message, valued `message-{offset}` unless `value` is given.
    /// Returns its offset.
    pub fn push(&self, partition: i32, value: Option<&[u8]>) -> i64 {
        let mut state = lock(&self.state);
        let messages = state.partitions.entry(partition).or_default();
        let offset = messages.len() as i64;
        let value = value.map_or_else(|| format!("message-{offset}").into_bytes(), <[u8]>::to_vec);

        messages.push(
            InboundMessage::new(self.topic.as_str(), partition, offset, value)
                .with_key(format!("key-{offset}").into_bytes()),
        );
        offset
    }

    /// Make `assign` fail with a transient error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn fail_next_assigns(&self, count: u32) {
        lock(&self.state).failing_assigns = count;
    }

    pub fn fail_next_fetches(&self, partition: i32, count: u32) {
        lock(&self.state).failing_fetches.insert(partition, count);
    }

    pub fn fail_fetches_fatally(&self, partition: i32, reason: &str) {
        lock(&self.state)
            .fatal_fetches
            .insert(partition, reason.to_owned());
    }

    /// Make the next fetch of `partition` start one offset early, the way a
    /// broker may hand out a message twice.
    pub fn redeliver_once(&self, partition: i32) {
        lock(&self.state).redeliver.insert(partition);
    }

    /// Every `from_offset` a partition was fetched from, in call order.
    pub fn fetches(&self, partition: i32) -> Vec<Option<i64>> {
        lock(&self.state)
            .fetches
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    fn read(
        &self,
        partition: i32,
        from_offset: Option<i64>,
        max_batch: usize,
    ) -> Result<Vec<InboundMessage>, FetchError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.fetches.push((partition, from_offset));

        if let Some(reason) = state.fatal_fetches.get(&partition) {
            return Err(FetchError::Fatal(reason.clone()));
        }
        if let Some(remaining) = state.failing_fetches.get_mut(&partition) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::Transient("broker not reachable".to_owned()));
            }
        }

        let redeliver = state.redeliver.remove(&partition);
        let messages = state.partitions.get(&partition).ok_or_else(|| {
            FetchError::Fatal(format!("partition {partition} does not exist"))
        })?;

        let from_offset = match (from_offset, self.start_position) {
            (Some(offset), _) if redeliver => offset.saturating_sub(1),
            (Some(offset), _) => offset,
            (None, StartPosition::Earliest) => 0,
            (None, StartPosition::Latest) => *state
                .start_offsets
                .entry(partition)
                .or_insert(messages.len() as i64),
        };
        let start = usize::try_from(from_offset.max(0)).unwrap_or(usize::MAX);

        Ok(messages
            .iter()
            .skip(start)
            .take(max_batch)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn assign(&self, topic: &str) -> Result<Vec<i32>, FetchError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FetchError::Transient("broker not reachable".to_owned()));
        }

        let mut state = lock(&self.state);
        if state.failing_assigns > 0 {
            state.failing_assigns -= 1;
            return Err(FetchError::Transient("broker not reachable".to_owned()));
        }
        if topic != self.topic {
            return Err(FetchError::Fatal(format!("unknown topic {topic}")));
        }
        Ok(state.partitions.keys().copied().collect())
    }

    async fn fetch(
        &self,
        partition: &Partition,
        from_offset: Option<i64>,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, FetchError> {
        let batch = self.read(partition.partition_number(), from_offset, max_batch)?;
        if batch.is_empty() {
            // Long poll, like a broker with nothing new to return
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }
}

/// A `MemoryCommitStore` whose availability tests can switch on and off.
#[derive(Default)]
pub struct FlakyCommitStore {
    inner: MemoryCommitStore,
    unavailable: AtomicBool,
    corrupt: AtomicBool,
    failing_puts: AtomicU32,
    failing_gets: AtomicU32,
    puts: Mutex<Vec<(i32, i64)>>,
}

impl FlakyCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make reads report unreadable content.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Successful writes, in order.
    pub fn puts(&self, partition: i32) -> Vec<i64> {
        lock(&self.puts)
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.inner.snapshot().get(partition).copied()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CommitStore for FlakyCommitStore {
    async fn get(&self, partition: &Partition) -> Result<Option<i64>, StoreError> {
        if self.corrupt.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("unreadable commit state".to_owned()));
        }
        if self.unavailable.load(Ordering::SeqCst) || Self::take_failure(&self.failing_gets) {
            return Err(StoreError::Unavailable("store offline".to_owned()));
        }
        self.inner.get(partition).await
    }

    async fn put(&self, partition: &Partition, offset: i64) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) || Self::take_failure(&self.failing_puts) {
            return Err(StoreError::Unavailable("store offline".to_owned()));
        }
        self.inner.put(partition, offset).await?;
        lock(&self.puts).push((partition.partition_number(), offset));
        Ok(())
    }
}

/// One `process` call seen by a `ScriptedHandler`.
#[derive(Debug, Clone, Copy)]
pub struct HandledCall {
    pub partition: i32,
    pub offset: i64,
    pub at: Instant,
}

/// Blocks the handler at one message until released.
struct Gate {
    partition: i32,
    offset: i64,
    started: Notify,
    release: Notify,
}

/// A handler returning preset results per message, recording every call.
pub struct ScriptedHandler {
    default: ProcessingResult,
    /// Results returned in sequence, then `default`
    scripted: Mutex<HashMap<(i32, i64), VecDeque<ProcessingResult>>>,
    /// Result returned on every call
    fixed: HashMap<(i32, i64), ProcessingResult>,
    panics: HashSet<(i32, i64)>,
    gate: Option<Arc<Gate>>,
    calls: Mutex<Vec<HandledCall>>,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::with_default(ProcessingResult::Success)
    }

    pub fn with_default(default: ProcessingResult) -> Self {
        Self {
            default,
            scripted: Mutex::new(HashMap::new()),
            fixed: HashMap::new(),
            panics: HashSet::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(
        mut self,
        partition: i32,
        offset: i64,
        results: impl IntoIterator<Item = ProcessingResult>,
    ) -> Self {
        self.scripted
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((partition, offset), results.into_iter().collect());
        self
    }

    pub fn always(mut self, partition: i32, offset: i64, result: ProcessingResult) -> Self {
        self.fixed.insert((partition, offset), result);
        self
    }

    pub fn panic_at(mut self, partition: i32, offset: i64) -> Self {
        self.panics.insert((partition, offset));
        self
    }

    /// Hold the handler at `offset` until `release` is called.
    pub fn gate_at(mut self, partition: i32, offset: i64) -> Self {
        self.gate = Some(Arc::new(Gate {
            partition,
            offset,
            started: Notify::new(),
            release: Notify::new(),
        }));
        self
    }

    /// Resolves once the gated message is being handled.
    pub async fn gate_reached(&self) {
        if let Some(gate) = &self.gate {
            gate.started.notified().await;
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.release.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<HandledCall> {
        lock(&self.calls).clone()
    }

    /// Offsets handed to the handler for `partition`, in call order.
    pub fn offsets(&self, partition: i32) -> Vec<i64> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.partition == partition)
            .map(|call| call.offset)
            .collect()
    }

    fn next_result(&self, key: (i32, i64)) -> ProcessingResult {
        if let Some(result) = self.fixed.get(&key) {
            return result.clone();
        }
        lock(&self.scripted)
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn process(&self, message: &InboundMessage) -> ProcessingResult {
        let key = (message.partition(), message.offset());
        lock(&self.calls).push(HandledCall {
            partition: key.0,
            offset: key.1,
            at: Instant::now(),
        });

        if let Some(gate) = self.gate.as_ref().filter(|g| (g.partition, g.offset) == key) {
            gate.started.notify_one();
            gate.release.notified().await;
        }

        if self.panics.contains(&key) {
            panic!("scripted panic at {}/{}", key.0, key.1);
        }
        self.next_result(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_broker_serves_from_offset() {
        let broker = InMemoryBroker::new("events").with_messages(0, 5);
        let partition = Partition::new("events", 0);

        let batch = broker
            .fetch(&partition, Some(2), 2, Duration::from_millis(10))
            .await
            .unwrap();

        let offsets: Vec<i64> = batch.iter().map(InboundMessage::offset).collect();
        assert_eq!(offsets, vec![2, 3]);
        assert_eq!(batch[0].value_str().unwrap(), "message-2");
        assert_eq!(broker.fetches(0), vec![Some(2)]);
    }

    #[tokio::test]
    async fn test_flaky_store_fails_the_requested_number_of_puts() {
        let store = FlakyCommitStore::new();
        let partition = Partition::new("events", 0);
        store.fail_next_puts(2);

        assert!(store.put(&partition, 1).await.is_err());
        assert!(store.put(&partition, 1).await.is_err());
        store.put(&partition, 1).await.unwrap();

        assert_eq!(store.puts(0), vec![1]);
        assert_eq!(store.get(&partition).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_scripted_handler_plays_results_in_order() {
        let handler = ScriptedHandler::new().script(
            0,
            3,
            [ProcessingResult::Retryable("busy".to_owned())],
        );
        let message = InboundMessage::new("events", 0, 3, b"x".to_vec());

        assert_eq!(
            handler.process(&message).await,
            ProcessingResult::Retryable("busy".to_owned())
        );
        assert_eq!(handler.process(&message).await, ProcessingResult::Success);
        assert_eq!(handler.offsets(0), vec![3, 3]);
    }
}
