use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::broker::StartPosition;
use crate::consumer::ConsumerConfig;
use crate::kafka::ClientConfigBuilder;
use crate::retry::{ExhaustedRetryPolicy, RetryPolicy};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(from = "POLL_TIMEOUT", default = "1000")]
    pub poll_timeout: EnvMsDuration,

    #[envconfig(from = "MAX_BATCH_SIZE", default = "100")]
    pub max_batch_size: usize,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    /// Bound on a single commit store call
    #[envconfig(from = "STORE_OP_TIMEOUT", default = "5000")]
    pub store_op_timeout: EnvMsDuration,

    /// How long a partition is held back by an unavailable store before it halts
    #[envconfig(from = "STORE_UNAVAILABLE_TIMEOUT", default = "60000")]
    pub store_unavailable_timeout: EnvMsDuration,

    #[envconfig(from = "STARTUP_DEADLINE", default = "30000")]
    pub startup_deadline: EnvMsDuration,

    #[envconfig(from = "COMMIT_STORE", default = "kafka")]
    pub commit_store: CommitStoreKind,

    #[envconfig(from = "COMMIT_STORE_PATH", default = "lambda-consumer-offsets.json")]
    pub commit_store_path: PathBuf,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_CONSUMER_TOPIC", default = "lambda-topic")]
    pub kafka_consumer_topic: NonEmptyString,

    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "lambda-consumer-group")]
    pub kafka_consumer_group: NonEmptyString,

    /// Used when there is no committed offset, or it is out of range
    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "earliest")]
    pub kafka_consumer_offset_reset: StartPosition,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "100000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_RETRIES", default = "5")]
    pub max_retries: u32,

    #[envconfig(from = "RETRY_EXHAUSTED_POLICY", default = "halt")]
    pub exhausted_policy: ExhaustedRetryPolicy,
}

impl RetryPolicyConfig {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            self.initial_interval.0,
            self.maximum_interval.0,
        )
        .with_max_retries(self.max_retries)
        .on_exhausted(self.exhausted_policy)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be a positive duration")]
    ZeroDuration(&'static str),
    #[error("MAX_BATCH_SIZE must be at least 1")]
    ZeroBatchSize,
    #[error("RETRY_BACKOFF_COEFFICIENT must be at least 1")]
    ZeroBackoffCoefficient,
    #[error("RETRY_MAXIMUM_INTERVAL must not be shorter than RETRY_INITIAL_INTERVAL")]
    MaximumIntervalTooShort,
}

impl Config {
    /// Load from the environment, falling back to defaults for unset variables.
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the parsers can't express on their own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("POLL_TIMEOUT", self.poll_timeout),
            ("RETRY_INITIAL_INTERVAL", self.retry_policy.initial_interval),
            ("RETRY_MAXIMUM_INTERVAL", self.retry_policy.maximum_interval),
            ("STORE_OP_TIMEOUT", self.store_op_timeout),
            ("STORE_UNAVAILABLE_TIMEOUT", self.store_unavailable_timeout),
            ("STARTUP_DEADLINE", self.startup_deadline),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.0.is_zero()) {
            return Err(ConfigError::ZeroDuration(name));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.retry_policy.backoff_coefficient == 0 {
            return Err(ConfigError::ZeroBackoffCoefficient);
        }
        if self.retry_policy.maximum_interval.0 < self.retry_policy.initial_interval.0 {
            return Err(ConfigError::MaximumIntervalTooShort);
        }
        Ok(())
    }

    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(
            self.kafka.kafka_consumer_topic.as_str(),
            self.kafka.kafka_consumer_group.as_str(),
        )
        .with_poll_timeout(self.poll_timeout.0)
        .with_max_batch_size(self.max_batch_size)
        .with_retry_policy(self.retry_policy.to_retry_policy())
        .with_store_unavailable_timeout(self.store_unavailable_timeout.0)
        .with_startup_deadline(self.startup_deadline.0)
    }

    pub fn kafka_client_config(&self) -> ClientConfig {
        ClientConfigBuilder::new(
            &self.kafka.kafka_hosts,
            self.kafka.kafka_consumer_group.as_str(),
        )
        .with_tls(self.kafka.kafka_tls)
        .offset_reset(self.kafka.kafka_consumer_offset_reset)
        .build()
    }
}

/// Where committed offsets are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStoreKind {
    Kafka,
    File,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a commit store, expected kafka or file")]
pub struct ParseCommitStoreKindError(String);

impl FromStr for CommitStoreKind {
    type Err = ParseCommitStoreKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "kafka" => Ok(CommitStoreKind::Kafka),
            "file" => Ok(CommitStoreKind::File),
            _ => Err(ParseCommitStoreKindError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("expected a duration in milliseconds")]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("value must not be empty")]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, envconfig::Error> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Config::init_from_hashmap(&env)
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.kafka.kafka_consumer_topic.as_str(), "lambda-topic");
        assert_eq!(config.commit_store, CommitStoreKind::Kafka);
        assert_eq!(config.kafka.kafka_consumer_offset_reset, StartPosition::Earliest);
        assert!(config.validate().is_ok());

        let consumer = config.to_consumer_config();
        assert_eq!(consumer.group_id, "lambda-consumer-group");
        assert_eq!(consumer.poll_timeout, Duration::from_secs(1));
        assert_eq!(consumer.retry_policy.max_retries(), 5);
        assert_eq!(
            consumer.retry_policy.exhausted_policy(),
            ExhaustedRetryPolicy::HaltPartition
        );
    }

    #[test]
    fn test_retry_policy_from_env() {
        let config = config_from(&[
            ("RETRY_INITIAL_INTERVAL", "100"),
            ("RETRY_MAXIMUM_INTERVAL", "1000"),
            ("RETRY_MAX_RETRIES", "3"),
            ("RETRY_EXHAUSTED_POLICY", "skip"),
        ])
        .unwrap();

        let policy = config.retry_policy.to_retry_policy();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.exhausted_policy(), ExhaustedRetryPolicy::SkipAndLog);
        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(5), Duration::from_millis(1000));
    }

    #[test]
    fn test_unparseable_values_fail_loading() {
        assert!(config_from(&[("POLL_TIMEOUT", "1s")]).is_err());
        assert!(config_from(&[("KAFKA_CONSUMER_TOPIC", "")]).is_err());
        assert!(config_from(&[("RETRY_EXHAUSTED_POLICY", "ignore")]).is_err());
        assert!(config_from(&[("COMMIT_STORE", "redis")]).is_err());
        assert!(config_from(&[("KAFKA_CONSUMER_OFFSET_RESET", "smallest")]).is_err());
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let zero_timeout = config_from(&[("STORE_OP_TIMEOUT", "0")]).unwrap();
        assert_eq!(
            zero_timeout.validate(),
            Err(ConfigError::ZeroDuration("STORE_OP_TIMEOUT"))
        );

        let zero_batch = config_from(&[("MAX_BATCH_SIZE", "0")]).unwrap();
        assert_eq!(zero_batch.validate(), Err(ConfigError::ZeroBatchSize));

        let inverted = config_from(&[
            ("RETRY_INITIAL_INTERVAL", "5000"),
            ("RETRY_MAXIMUM_INTERVAL", "1000"),
        ])
        .unwrap();
        assert_eq!(inverted.validate(), Err(ConfigError::MaximumIntervalTooShort));
    }

    #[test]
    fn test_kafka_client_config() {
        let config = config_from(&[("KAFKA_HOSTS", "kafka:9092"), ("KAFKA_TLS", "true")]).unwrap();
        let client = config.kafka_client_config();

        assert_eq!(client.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(client.get("security.protocol"), Some("ssl"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
    }
}
