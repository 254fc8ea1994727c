use std::str::FromStr;
use std::time;

use thiserror::Error;

/// What a partition worker does with a message that is still `Retryable`
/// after the retry budget ran out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExhaustedRetryPolicy {
    /// Log the offset and reason, commit it and move on.
    SkipAndLog,
    /// Stop consuming the partition, leaving the message uncommitted.
    HaltPartition,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid exhausted retry policy, expected skip or halt")]
pub struct ParseExhaustedRetryPolicyError(String);

impl FromStr for ExhaustedRetryPolicy {
    type Err = ParseExhaustedRetryPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "skip" | "skip-and-log" | "skip_and_log" => Ok(ExhaustedRetryPolicy::SkipAndLog),
            "halt" | "halt-partition" | "halt_partition" => {
                Ok(ExhaustedRetryPolicy::HaltPartition)
            }
            _ => Err(ParseExhaustedRetryPolicyError(s.to_owned())),
        }
    }
}

#[derive(Copy, Clone, Debug)]
/// The retry policy partition workers use to space out attempts, for handler
/// retries as well as for fetch and commit-store retries.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// How many times a `Retryable` message is handed to the handler again.
    max_retries: u32,
    on_exhausted: ExhaustedRetryPolicy,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn on_exhausted(mut self, policy: ExhaustedRetryPolicy) -> Self {
        self.on_exhausted = policy;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn exhausted_policy(&self) -> ExhaustedRetryPolicy {
        self.on_exhausted
    }

    /// Calculate the delay before retrying, given how many retries already happened.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        std::cmp::min(candidate_interval, self.maximum_interval)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(100),
            max_retries: 5,
            on_exhausted: ExhaustedRetryPolicy::HaltPartition,
        }
    }
}
