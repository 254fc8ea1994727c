use rdkafka::ClientConfig;

use crate::broker::StartPosition;

/// Kafka client configuration builder with the defaults the consumer needs.
///
/// Partition readers are assign-only: they never join the consumer group and
/// never commit on their own. `group.id` is still set, since committed offsets
/// are kept under it.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Where to start when the requested offset is out of range
    pub fn offset_reset(mut self, position: StartPosition) -> Self {
        self.config.set("auto.offset.reset", position.as_str());
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_automatic_commits() {
        let config = ClientConfigBuilder::new("localhost:9092", "lambda-consumer-group").build();

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("group.id"), Some("lambda-consumer-group"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls_and_offset_reset() {
        let config = ClientConfigBuilder::new("kafka:9093", "g")
            .with_tls(true)
            .offset_reset(StartPosition::Latest)
            .build();

        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
    }
}
