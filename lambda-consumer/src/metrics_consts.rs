// ==== Consumer loop metrics ====
/// Gauge for the consumer lifecycle state (0 starting, 1 running, 2 draining, 3 stopped)
pub const CONSUMER_STATE: &str = "lambda_consumer_state";

/// Gauge for the number of partition workers currently running
pub const ACTIVE_PARTITION_WORKERS: &str = "lambda_consumer_active_partition_workers";

// ==== Partition worker metrics ====
/// Counter for messages fetched from the broker
pub const MESSAGES_FETCHED: &str = "lambda_consumer_messages_fetched_total";

/// Counter for handler results, labelled by result type
pub const MESSAGES_PROCESSED: &str = "lambda_consumer_messages_processed_total";

/// Histogram for the duration of a single handler invocation
pub const MESSAGE_PROCESSING_DURATION: &str = "lambda_consumer_message_processing_duration_seconds";

/// Counter for handler retries
pub const HANDLER_RETRIES: &str = "lambda_consumer_handler_retries_total";

/// Counter for messages skipped after their retries were exhausted
pub const MESSAGES_SKIPPED: &str = "lambda_consumer_messages_skipped_total";

/// Counter for messages below the resume offset that were dropped
pub const MESSAGES_REDELIVERED: &str = "lambda_consumer_messages_redelivered_total";

/// Counter for transient fetch errors
pub const FETCH_ERRORS: &str = "lambda_consumer_fetch_errors_total";

/// Counter for halted partitions, labelled by reason
pub const PARTITIONS_HALTED: &str = "lambda_consumer_partitions_halted_total";

// ==== Offset tracker metrics ====
/// Gauge for the last committed offset per partition
pub const PARTITION_COMMITTED_OFFSET: &str = "lambda_consumer_partition_committed_offset";

/// Counter for commit store calls that failed or timed out
pub const STORE_UNAVAILABLE: &str = "lambda_consumer_store_unavailable_total";

// ==== HTTP server metrics ====
/// Counter for probe and scrape requests, labelled by method, path and status
pub const HTTP_REQUESTS: &str = "lambda_consumer_http_requests_total";

/// Histogram for probe and scrape request latency
pub const HTTP_REQUEST_DURATION: &str = "lambda_consumer_http_request_duration_seconds";
