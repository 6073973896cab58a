//! Metrics module for the Logos gateway
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use self::prometheus::{
    encode_metrics, record_completion, record_rejected, record_timeout, register_metrics,
    set_queue_size, PrometheusMonitor, IN_FLIGHT_REQUESTS, QUEUE_SIZE, QUEUE_WAIT_SECONDS,
    REQUESTS_REJECTED_TOTAL, REQUESTS_TIMEOUT_TOTAL, REQUESTS_TOTAL, SCHEDULED_TOTAL,
};
