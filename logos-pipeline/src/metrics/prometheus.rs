//! Prometheus metrics for the Logos gateway
//!
//! Exposes scheduling metrics in Prometheus format for monitoring and observability.

use async_trait::async_trait;
use lazy_static::lazy_static;
use logos_core::{
    DeploymentId, RequestId, RequestMetrics, SchedulerStats, SchedulingCandidate, SchedulingResult,
};
use prometheus::{
    core::Collector, Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::collaborators::Monitor;
use crate::error::PipelineError;

lazy_static! {
    /// Global Prometheus registry for Logos metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Finished pipeline runs by outcome (`scheduled` or an error kind)
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of pipeline requests")
            .namespace("logos"),
        &["outcome"]
    ).expect("metric can be created");

    /// Grants by provider kind and whether the request waited in a queue
    pub static ref SCHEDULED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("scheduled_total", "Total requests granted a deployment")
            .namespace("logos"),
        &["provider_kind", "queued"]
    ).expect("metric can be created");

    /// Processing time histogram with priority label
    pub static ref PROCESSING_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "processing_seconds",
            "Time from grant to completion in seconds"
        )
        .namespace("logos")
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["priority"]
    ).expect("metric can be created");

    /// Completions that had to load the model first
    pub static ref COLD_STARTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cold_starts_total", "Total requests served by a cold model")
            .namespace("logos")
    ).expect("metric can be created");

    // ============== Queue Metrics ==============

    /// Current queue size gauge
    pub static ref QUEUE_SIZE: Gauge = Gauge::with_opts(
        Opts::new("queue_size", "Current number of requests waiting for capacity")
            .namespace("logos")
    ).expect("metric can be created");

    /// Queue wait time histogram
    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "queue_wait_seconds",
            "Time between arrival and begin-processing"
        )
        .namespace("logos")
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0])
    ).expect("metric can be created");

    /// Requests currently holding capacity
    pub static ref IN_FLIGHT_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("in_flight_requests", "Number of requests currently holding capacity")
            .namespace("logos")
    ).expect("metric can be created");

    /// Requests rejected counter (no capacity, queue full)
    pub static ref REQUESTS_REJECTED_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_rejected_total", "Total requests rejected for lack of capacity")
            .namespace("logos")
    ).expect("metric can be created");

    /// Requests timed out counter
    pub static ref REQUESTS_TIMEOUT_TOTAL: Counter = Counter::with_opts(
        Opts::new("requests_timeout_total", "Total requests that timed out in the queue")
            .namespace("logos")
    ).expect("metric can be created");
}

fn register(collector: Box<dyn Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register all metrics with the global registry.
/// Safe to call more than once.
pub fn register_metrics() -> prometheus::Result<()> {
    // Request metrics
    register(Box::new(REQUESTS_TOTAL.clone()))?;
    register(Box::new(SCHEDULED_TOTAL.clone()))?;
    register(Box::new(PROCESSING_SECONDS.clone()))?;
    register(Box::new(COLD_STARTS_TOTAL.clone()))?;

    // Queue metrics
    register(Box::new(QUEUE_SIZE.clone()))?;
    register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    register(Box::new(IN_FLIGHT_REQUESTS.clone()))?;
    register(Box::new(REQUESTS_REJECTED_TOTAL.clone()))?;
    register(Box::new(REQUESTS_TIMEOUT_TOTAL.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Update queue size gauge.
pub fn set_queue_size(size: u64) {
    QUEUE_SIZE.set(size as f64);
}

/// Record a rejected request.
pub fn record_rejected() {
    REQUESTS_REJECTED_TOTAL.inc();
}

/// Record a timed out request.
pub fn record_timeout() {
    REQUESTS_TIMEOUT_TOTAL.inc();
}

/// Record a completed request.
pub fn record_completion(metrics: &RequestMetrics) {
    let priority = metrics.priority.to_string();
    PROCESSING_SECONDS
        .with_label_values(&[&priority])
        .observe(metrics.processing_time.as_secs_f64());
    if let Some(wait) = metrics.queue_wait {
        QUEUE_WAIT_SECONDS.observe(wait.as_secs_f64());
    }
    if metrics.was_cold_start {
        COLD_STARTS_TOTAL.inc();
    }
}

/// [`Monitor`] backed by the global registry
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMonitor;

impl PrometheusMonitor {
    /// Create the monitor, registering the metrics if needed
    pub fn new() -> prometheus::Result<Self> {
        register_metrics()?;
        Ok(Self)
    }
}

#[async_trait]
impl Monitor for PrometheusMonitor {
    async fn on_scheduled(&self, _request_id: &RequestId, scheduling: &SchedulingResult) {
        let queued = if scheduling.was_queued { "true" } else { "false" };
        SCHEDULED_TOTAL
            .with_label_values(&[&scheduling.provider_kind.to_string(), queued])
            .inc();
        REQUESTS_TOTAL.with_label_values(&["scheduled"]).inc();
    }

    async fn on_completed(&self, _deployment: DeploymentId, metrics: &RequestMetrics) {
        record_completion(metrics);
    }

    async fn on_failed(&self, _request_id: &RequestId, error: &PipelineError) {
        REQUESTS_TOTAL.with_label_values(&[error.kind()]).inc();
        match error {
            PipelineError::Timeout { .. } => record_timeout(),
            PipelineError::NoCapacity { .. } => record_rejected(),
            _ => {}
        }
    }

    async fn on_enqueued(&self, _request_id: &RequestId, _candidates: &[SchedulingCandidate]) {}

    async fn on_load(&self, stats: SchedulerStats) {
        set_queue_size(stats.num_waiting as u64);
        IN_FLIGHT_REQUESTS.set(stats.num_in_flight as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_core::Priority;
    use std::time::Duration;

    #[test]
    fn test_register_metrics_twice() {
        register_metrics().unwrap();
        register_metrics().unwrap();
    }

    #[test]
    fn test_record_completion() {
        let before = COLD_STARTS_TOTAL.get();
        record_completion(&RequestMetrics {
            request_id: RequestId::from("req-1"),
            queue_wait: Some(Duration::from_millis(250)),
            was_cold_start: true,
            processing_time: Duration::from_secs(2),
            queue_depth_at_arrival: 3,
            priority: Priority::High,
        });
        assert!(COLD_STARTS_TOTAL.get() >= before + 1.0);
        assert!(PROCESSING_SECONDS.with_label_values(&["high"]).get_sample_count() >= 1);
    }

    #[tokio::test]
    async fn test_monitor_counts_failures() {
        let monitor = PrometheusMonitor::new().unwrap();
        let before = REQUESTS_TIMEOUT_TOTAL.get();

        let error = PipelineError::Timeout {
            request_id: RequestId::from("req-2"),
            waited: Duration::from_secs(300),
        };
        monitor.on_failed(&RequestId::from("req-2"), &error).await;

        assert!(REQUESTS_TIMEOUT_TOTAL.get() >= before + 1.0);
        assert!(REQUESTS_TOTAL.with_label_values(&["timeout"]).get() >= 1.0);
    }

    #[tokio::test]
    async fn test_encode_metrics() {
        let monitor = PrometheusMonitor::new().unwrap();
        monitor.on_load(SchedulerStats { num_waiting: 4, num_in_flight: 2 }).await;

        let output = encode_metrics();
        assert!(output.contains("logos_queue_size"));
        assert!(output.contains("logos_in_flight_requests"));
    }
}
