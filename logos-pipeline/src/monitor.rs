//! Built-in [`Monitor`] implementations.

use std::sync::Arc;

use async_trait::async_trait;
use logos_core::{
    DeploymentId, RequestId, RequestMetrics, SchedulerStats, SchedulingCandidate, SchedulingResult,
};
use tracing::{debug, info, warn};

use crate::collaborators::Monitor;
use crate::error::PipelineError;

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

#[async_trait]
impl Monitor for NoopMonitor {}

/// Emits pipeline events as structured `tracing` events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

#[async_trait]
impl Monitor for TracingMonitor {
    async fn on_enqueued(&self, request_id: &RequestId, candidates: &[SchedulingCandidate]) {
        debug!(
            request_id = %request_id,
            candidates = candidates.len(),
            priority = %candidates.first().map(|c| c.priority).unwrap_or_default(),
            "Request classified"
        );
    }

    async fn on_scheduled(&self, request_id: &RequestId, scheduling: &SchedulingResult) {
        info!(
            request_id = %request_id,
            deployment = %scheduling.deployment,
            provider_kind = %scheduling.provider_kind,
            queued = scheduling.was_queued,
            queue_depth = scheduling.queue_depth_at_schedule,
            cold_start = scheduling.is_cold_start,
            priority = %scheduling.priority,
            "Request dispatched"
        );
    }

    async fn on_completed(&self, deployment: DeploymentId, metrics: &RequestMetrics) {
        info!(
            request_id = %metrics.request_id,
            deployment = %deployment,
            processing_ms = metrics.processing_time.as_millis() as u64,
            queue_wait_ms = metrics.queue_wait.map(|w| w.as_millis() as u64),
            cold_start = metrics.was_cold_start,
            priority = %metrics.priority,
            "Request completed"
        );
    }

    async fn on_failed(&self, request_id: &RequestId, error: &PipelineError) {
        warn!(request_id = %request_id, kind = error.kind(), error = %error, "Request failed");
    }

    async fn on_load(&self, stats: SchedulerStats) {
        debug!(waiting = stats.num_waiting, in_flight = stats.num_in_flight, "{}", stats);
    }
}

/// Fans every event out to several monitors, in order
#[derive(Clone, Default)]
pub struct CompositeMonitor {
    monitors: Vec<Arc<dyn Monitor>>,
}

impl CompositeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitors.push(monitor);
        self
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

#[async_trait]
impl Monitor for CompositeMonitor {
    async fn on_enqueued(&self, request_id: &RequestId, candidates: &[SchedulingCandidate]) {
        for monitor in &self.monitors {
            monitor.on_enqueued(request_id, candidates).await;
        }
    }

    async fn on_scheduled(&self, request_id: &RequestId, scheduling: &SchedulingResult) {
        for monitor in &self.monitors {
            monitor.on_scheduled(request_id, scheduling).await;
        }
    }

    async fn on_completed(&self, deployment: DeploymentId, metrics: &RequestMetrics) {
        for monitor in &self.monitors {
            monitor.on_completed(deployment, metrics).await;
        }
    }

    async fn on_failed(&self, request_id: &RequestId, error: &PipelineError) {
        for monitor in &self.monitors {
            monitor.on_failed(request_id, error).await;
        }
    }

    async fn on_load(&self, stats: SchedulerStats) {
        for monitor in &self.monitors {
            monitor.on_load(stats).await;
        }
    }
}
