use std::fmt;

/// A single partition of the consumed topic. Partitions are the unit of
/// ordering and of failure isolation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_topic_and_partition() {
        let partition = Partition::new("lambda-topic", 3);
        assert_eq!(partition.to_string(), "lambda-topic/3");
    }

    #[test]
    fn test_partitions_order_by_topic_then_number() {
        let mut partitions = vec![
            Partition::new("b", 0),
            Partition::new("a", 2),
            Partition::new("a", 1),
        ];
        partitions.sort();
        assert_eq!(
            partitions,
            vec![
                Partition::new("a", 1),
                Partition::new("a", 2),
                Partition::new("b", 0)
            ]
        );
    }
}
