// Kafka module - rdkafka implementations of the broker and commit store seams
pub mod broker;
pub mod commit_store;
pub mod config;

pub use broker::KafkaBroker;
pub use commit_store::KafkaCommitStore;
pub use config::ClientConfigBuilder;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Whether retrying the failed operation can never succeed.
pub(crate) fn is_fatal_error(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
        )
    )
}
