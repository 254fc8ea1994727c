//! Kafka consumer service handing every message of a topic to a `MessageHandler`.
//!
//! Each assigned partition is consumed by its own worker, in offset order, and
//! a message is committed only once it was handled. Delivery is at least once.
//!
//! ## Error logging
//!
//! When logging errors with a cause chain, use `{e:#}` inline or `error = ?e`
//! as a structured field so root causes stay visible. `%e` only shows the
//! top-level message.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod message;
pub mod metrics;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_worker;
pub mod retry;
pub mod store;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use broker::BrokerClient;
pub use consumer::{ConsumerConfig, ConsumerLoop, ConsumerReport, ConsumerState};
pub use handler::{LoggingHandler, MessageHandler};
pub use message::{InboundMessage, ProcessingResult};
pub use offset_tracker::OffsetTracker;
pub use partition_worker::PartitionOutcome;
pub use types::Partition;
