use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::FetchError;
use crate::message::InboundMessage;
use crate::types::Partition;

/// Where a partition with no committed offset starts consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// The oldest retained message
    #[default]
    Earliest,
    /// Only messages produced after the consumer started
    Latest,
}

impl StartPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a start position, expected earliest or latest")]
pub struct ParseStartPositionError(String);

impl FromStr for StartPosition {
    type Err = ParseStartPositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "earliest" => Ok(StartPosition::Earliest),
            "latest" => Ok(StartPosition::Latest),
            _ => Err(ParseStartPositionError(s.to_owned())),
        }
    }
}

/// The client side of the message broker, as seen by the consumer loop.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Partitions of `topic` this consumer instance is responsible for.
    async fn assign(&self, topic: &str) -> Result<Vec<i32>, FetchError>;

    /// Fetch up to `max_batch` messages of `partition`, in offset order,
    /// starting at `from_offset`. `None` means the partition has no committed
    /// offset yet and reading starts at the broker's configured
    /// `StartPosition`. Waits at most `timeout` for the first message and
    /// returns an empty batch if none arrived. Calls may restart from any
    /// offset.
    async fn fetch(
        &self,
        partition: &Partition,
        from_offset: Option<i64>,
        max_batch: usize,
        timeout: Duration,
    ) -> Result<Vec<InboundMessage>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_position() {
        assert_eq!("earliest".parse(), Ok(StartPosition::Earliest));
        assert_eq!(" Latest ".parse(), Ok(StartPosition::Latest));
        assert!("smallest".parse::<StartPosition>().is_err());
        assert_eq!(StartPosition::Latest.as_str(), "latest");
    }
}
