use std::hash::Hasher;

use chrono::{DateTime, Utc};
use siphasher::sip::SipHasher13;

use crate::types::Partition;

/// A message as fetched from the broker. Immutable once built: the worker that
/// fetched it owns it and lends it to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    timestamp: Option<DateTime<Utc>>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn partition_key(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }

    /// The value as UTF-8 text.
    pub fn value_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }

    /// Stable fingerprint of key and value, used in logs in place of the payload.
    pub fn digest(&self) -> String {
        let mut hasher = SipHasher13::new();
        match &self.key {
            Some(key) => {
                hasher.write_u8(1);
                hasher.write_usize(key.len());
                hasher.write(key);
            }
            None => hasher.write_u8(0),
        }
        hasher.write(&self.value);
        format!("{:016x}", hasher.finish())
    }
}

/// Outcome of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    /// The message may succeed if handled again later.
    Retryable(String),
    /// The message can never be handled. Never retried.
    Fatal(String),
}

impl ProcessingResult {
    pub fn result_type(&self) -> &'static str {
        match self {
            ProcessingResult::Success => "success",
            ProcessingResult::Retryable(_) => "retryable",
            ProcessingResult::Fatal(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_for_equal_messages() {
        let a = InboundMessage::new("t", 0, 1, b"hello".to_vec());
        let b = InboundMessage::new("t", 4, 99, b"hello".to_vec());

        // Coordinates do not take part in the digest, only the content does
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 16);
    }

    #[test]
    fn test_digest_depends_on_key() {
        let plain = InboundMessage::new("t", 0, 1, b"hello".to_vec());
        let keyed = plain.clone().with_key(b"k".to_vec());
        let empty_key = plain.clone().with_key(Vec::new());

        assert_ne!(plain.digest(), keyed.digest());
        assert_ne!(plain.digest(), empty_key.digest());
    }

    #[test]
    fn test_value_str_rejects_invalid_utf8() {
        let valid = InboundMessage::new("t", 0, 0, "A mensagem".as_bytes().to_vec());
        assert_eq!(valid.value_str().unwrap(), "A mensagem");

        let invalid = InboundMessage::new("t", 0, 0, vec![0xff, 0xfe]);
        assert!(invalid.value_str().is_err());
    }

    #[test]
    fn test_partition_key() {
        let message = InboundMessage::new("lambda-topic", 2, 10, vec![]);
        assert_eq!(message.partition_key(), Partition::new("lambda-topic", 2));
    }
}
