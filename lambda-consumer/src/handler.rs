use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::message::{InboundMessage, ProcessingResult};

/// Processes one inbound message.
///
/// Messages are delivered at least once: after a restart or a retry the same
/// message can be handed over again, so implementations must make processing
/// a message twice leave downstream state as if it had been processed once.
/// Every failure is reported through the returned `ProcessingResult`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process(&self, message: &InboundMessage) -> ProcessingResult;
}

/// Logs every received message.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn process(&self, message: &InboundMessage) -> ProcessingResult {
        let value = match message.value_str() {
            Ok(value) => value,
            Err(e) => return ProcessingResult::Fatal(format!("payload is not valid UTF-8: {e}")),
        };
        let key = message.key().map(String::from_utf8_lossy);

        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            key = ?key,
            timestamp = ?message.timestamp(),
            value = value,
            "Message received"
        );
        ProcessingResult::Success
    }
}

/// Errors a downstream `MessageService` reports back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("service rejected the message: {0}")]
    Rejected(String),
}

/// A downstream service messages are delegated to.
#[async_trait]
pub trait MessageService: Send + Sync {
    async fn handle(&self, key: Option<&str>, value: &str) -> Result<(), ServiceError>;
}

/// Decodes each message and hands it to a `MessageService`.
pub struct ServiceHandler<S> {
    service: S,
}

impl<S: MessageService> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }
}

#[async_trait]
impl<S: MessageService> MessageHandler for ServiceHandler<S> {
    async fn process(&self, message: &InboundMessage) -> ProcessingResult {
        let value = match message.value_str() {
            Ok(value) => value,
            Err(e) => return ProcessingResult::Fatal(format!("payload is not valid UTF-8: {e}")),
        };
        let key = match message.key().map(std::str::from_utf8).transpose() {
            Ok(key) => key,
            Err(e) => return ProcessingResult::Fatal(format!("key is not valid UTF-8: {e}")),
        };

        match self.service.handle(key, value).await {
            Ok(()) => ProcessingResult::Success,
            Err(e @ ServiceError::Unavailable(_)) => ProcessingResult::Retryable(e.to_string()),
            Err(e @ ServiceError::Rejected(_)) => ProcessingResult::Fatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_logging_handler_accepts_text() {
        let message = InboundMessage::new("lambda-topic", 0, 0, b"hello".to_vec());
        assert_eq!(
            LoggingHandler.process(&message).await,
            ProcessingResult::Success
        );
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_timestamped_message() {
        let timestamp = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let message = InboundMessage::new("lambda-topic", 0, 3, b"A mensagem chegou".to_vec())
            .with_timestamp(timestamp);

        assert_eq!(message.timestamp(), Some(timestamp));
        assert_eq!(LoggingHandler.process(&message).await, ProcessingResult::Success);
    }

    #[tokio::test]
    async fn test_logging_handler_rejects_binary_payload() {
        let message = InboundMessage::new("lambda-topic", 0, 0, vec![0xc3, 0x28]);
        assert!(matches!(
            LoggingHandler.process(&message).await,
            ProcessingResult::Fatal(_)
        ));
    }

    /// Service returning a scripted error and recording what it received
    struct ScriptedService {
        error: Option<ServiceError>,
        received: Mutex<Vec<(Option<String>, String)>>,
    }

    impl ScriptedService {
        fn new(error: Option<ServiceError>) -> Self {
            Self {
                error,
                received: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl MessageService for ScriptedService {
        async fn handle(&self, key: Option<&str>, value: &str) -> Result<(), ServiceError> {
            self.received
                .lock()
                .unwrap()
                .push((key.map(str::to_owned), value.to_owned()));
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_service_handler_delegates_key_and_value() {
        let handler = ServiceHandler::new(ScriptedService::new(None));
        let message =
            InboundMessage::new("lambda-topic", 1, 7, b"payload".to_vec()).with_key(b"k1".to_vec());

        assert_eq!(handler.process(&message).await, ProcessingResult::Success);
        assert_eq!(
            *handler.service().received.lock().unwrap(),
            vec![(Some("k1".to_owned()), "payload".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_service_handler_maps_errors() {
        let message = InboundMessage::new("lambda-topic", 0, 0, b"payload".to_vec());

        let unavailable = ServiceHandler::new(ScriptedService::new(Some(
            ServiceError::Unavailable("connection refused".to_owned()),
        )));
        assert!(matches!(
            unavailable.process(&message).await,
            ProcessingResult::Retryable(_)
        ));

        let rejected = ServiceHandler::new(ScriptedService::new(Some(ServiceError::Rejected(
            "schema mismatch".to_owned(),
        ))));
        assert!(matches!(
            rejected.process(&message).await,
            ProcessingResult::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_service_handler_does_not_call_service_for_invalid_key() {
        let handler = ServiceHandler::new(ScriptedService::new(None));
        let message =
            InboundMessage::new("lambda-topic", 0, 0, b"payload".to_vec()).with_key(vec![0xff]);

        assert!(matches!(
            handler.process(&message).await,
            ProcessingResult::Fatal(_)
        ));
        assert!(handler.service().received.lock().unwrap().is_empty());
    }
}
