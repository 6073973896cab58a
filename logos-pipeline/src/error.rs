//! Error types for the Logos request pipeline.

use std::time::Duration;

use logos_core::{RequestId, SchedulingError, SchedulingResult};

/// Pipeline error types
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Classification produced no candidate deployment (terminal)
    #[error("No candidates passed classification for request {request_id}")]
    NoCandidates { request_id: RequestId },

    /// The classifier itself failed
    #[error("Classification failed for request {request_id}: {source}")]
    Classification {
        request_id: RequestId,
        #[source]
        source: anyhow::Error,
    },

    /// The queue wait elapsed before a slot was handed over
    #[error("Request {request_id} timed out after {waited:?} waiting for capacity")]
    Timeout { request_id: RequestId, waited: Duration },

    /// Every candidate was unavailable and the request could not be queued
    #[error("All candidates unavailable for request {request_id}: {reason}")]
    NoCapacity { request_id: RequestId, reason: String },

    /// Context resolution failed after scheduling succeeded.
    ///
    /// The capacity reserved by `scheduling` is still held; the caller
    /// releases it through [`crate::Pipeline::complete`] or retries resolution.
    #[error("Context resolution failed for request {request_id} on {}: {source}", scheduling.deployment)]
    Resolution {
        request_id: RequestId,
        scheduling: SchedulingResult,
        #[source]
        source: anyhow::Error,
    },

    /// Any other scheduler failure (unregistered deployment, unknown request)
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}

impl PipelineError {
    /// Map a scheduler failure into the pipeline's outcome taxonomy
    pub fn from_scheduling(error: SchedulingError) -> Self {
        match error {
            SchedulingError::QueueTimeout { request_id, waited } => Self::Timeout { request_id, waited },
            SchedulingError::NoCapacity { request_id, reason } => Self::NoCapacity { request_id, reason },
            other => Self::Scheduling(other),
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NoCandidates { .. } => "no_candidates",
            PipelineError::Classification { .. } => "classification",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::NoCapacity { .. } => "no_capacity",
            PipelineError::Resolution { .. } => "resolution",
            PipelineError::Scheduling(_) => "scheduling",
        }
    }

    /// Whether the request may succeed if retried later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout { .. }
                | PipelineError::NoCapacity { .. }
                | PipelineError::Resolution { .. }
        )
    }

    /// Scheduling result still holding capacity, if any
    pub fn held_capacity(&self) -> Option<&SchedulingResult> {
        match self {
            PipelineError::Resolution { scheduling, .. } => Some(scheduling),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_core::{DeploymentId, Priority, ProviderKind, ProviderMetrics, SdiError};

    fn scheduling() -> SchedulingResult {
        SchedulingResult {
            deployment: DeploymentId::new(3, 1),
            provider_kind: ProviderKind::Local,
            was_queued: false,
            queue_depth_at_schedule: 0,
            utilization_at_arrival: Some(0.25),
            provider_metrics: ProviderMetrics::Local { available_vram_mb: 1024 },
            priority: Priority::Normal,
            is_cold_start: false,
        }
    }

    #[test]
    fn test_from_scheduling() {
        let id = RequestId::from("req-1");

        let err = PipelineError::from_scheduling(SchedulingError::QueueTimeout {
            request_id: id.clone(),
            waited: Duration::from_secs(300),
        });
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert_eq!(err.kind(), "timeout");

        let err = PipelineError::from_scheduling(SchedulingError::no_capacity(&id, "queue full"));
        assert!(matches!(err, PipelineError::NoCapacity { ref reason, .. } if reason == "queue full"));

        let err = PipelineError::from_scheduling(SdiError::unregistered(3, "ollama").into());
        assert!(matches!(err, PipelineError::Scheduling(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_resolution_carries_result() {
        let err = PipelineError::Resolution {
            request_id: RequestId::from("req-1"),
            scheduling: scheduling(),
            source: anyhow::anyhow!("no API key for provider"),
        };

        assert!(err.is_recoverable());
        assert_eq!(err.held_capacity().map(|s| s.deployment), Some(DeploymentId::new(3, 1)));
        assert_eq!(
            err.to_string(),
            "Context resolution failed for request req-1 on 3@1: no API key for provider"
        );
    }
}
