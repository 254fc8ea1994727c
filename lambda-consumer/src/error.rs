use std::time::Duration;

use thiserror::Error;

use crate::types::Partition;

/// Errors returned by a `BrokerClient`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("broker error that cannot be retried: {0}")]
    Fatal(String),
}

/// Errors returned by a `CommitStore`. Every variant means the commit state is
/// currently unavailable to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("commit store unavailable: {0}")]
    Unavailable(String),
    #[error("commit store did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("commit store content is invalid: {0}")]
    Corrupt(String),
}

/// Why a partition worker stopped consuming before shutdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    #[error("handler reported a fatal failure: {0}")]
    HandlerFatal(String),
    #[error("handler still failing after {retries} retries: {reason}")]
    RetriesExhausted { retries: u32, reason: String },
    #[error("offset could not be committed: {0}")]
    StoreUnavailable(StoreError),
    #[error("fetch failed permanently: {0}")]
    FetchFatal(String),
}

impl HaltReason {
    pub fn reason_type(&self) -> &'static str {
        match self {
            HaltReason::HandlerFatal(_) => "handler_fatal",
            HaltReason::RetriesExhausted { .. } => "retries_exhausted",
            HaltReason::StoreUnavailable(_) => "store_unavailable",
            HaltReason::FetchFatal(_) => "fetch_fatal",
        }
    }
}

/// Errors that stop the whole consumer. All of them happen while starting.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("could not get partitions for topic {topic}: {source}")]
    Assignment { topic: String, source: FetchError },
    #[error("topic {0} has no partitions to consume")]
    NoPartitions(String),
    #[error("could not load the committed offset of {partition}: {source}")]
    LoadOffsets {
        partition: Partition,
        source: StoreError,
    },
    #[error("consumer did not start within {0:?}")]
    StartupTimeout(Duration),
}
