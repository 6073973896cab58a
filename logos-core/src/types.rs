//! Shared data model for deployments, scheduling requests and results.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::QueueState;

/// Identifies a model hosted by a specific provider; the unit of capacity and queuing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentId {
    pub model_id: u64,
    pub provider_id: u64,
}

impl DeploymentId {
    pub const fn new(model_id: u64, provider_id: u64) -> Self {
        Self { model_id, provider_id }
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.provider_id)
    }
}

/// Kind of provider hosting a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Locally hosted, VRAM-bound, with cold starts
    Local,
    /// Remote API with header-reported rate limits
    Cloud,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Cloud => write!(f, "cloud"),
        }
    }
}

/// Queue priority tier
///
/// Ordering follows urgency: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Tiers in dequeue order
    pub const DEQUEUE_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Map an integer priority level emitted by classification onto a tier.
    ///
    /// Levels up to 3 are LOW, 8 and above are HIGH, everything else NORMAL.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=3 => Priority::Low,
            8..=i32::MAX => Priority::High,
            _ => Priority::Normal,
        }
    }

    /// The next tier up, if any
    pub fn promoted(self) -> Option<Self> {
        match self {
            Priority::Low => Some(Priority::Normal),
            Priority::Normal => Some(Priority::High),
            Priority::High => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Caller-visible request identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Registration data for a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    pub deployment: DeploymentId,

    pub kind: ProviderKind,

    /// Model name as the provider knows it (e.g. `llama3.2:3b`, `gpt-4o-mini`)
    pub model_name: String,

    /// Per-model-provider parallel capacity override (local only)
    pub parallel_capacity: Option<usize>,

    /// Total VRAM of the hosting provider in MB (local only)
    pub total_vram_mb: Option<u64>,

    /// Externally-assigned deployment identifier (cloud only)
    pub external_id: Option<String>,
}

impl DeploymentMetadata {
    /// Metadata for a locally hosted deployment
    pub fn local(deployment: DeploymentId, model_name: impl Into<String>) -> Self {
        Self {
            deployment,
            kind: ProviderKind::Local,
            model_name: model_name.into(),
            parallel_capacity: None,
            total_vram_mb: None,
            external_id: None,
        }
    }

    /// Metadata for a cloud deployment
    pub fn cloud(
        deployment: DeploymentId,
        model_name: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            deployment,
            kind: ProviderKind::Cloud,
            model_name: model_name.into(),
            parallel_capacity: None,
            total_vram_mb: None,
            external_id: Some(external_id.into()),
        }
    }

    pub fn with_parallel_capacity(mut self, capacity: usize) -> Self {
        self.parallel_capacity = Some(capacity);
        self
    }

    pub fn with_total_vram_mb(mut self, total_vram_mb: u64) -> Self {
        self.total_vram_mb = Some(total_vram_mb);
        self
    }
}

/// A ranked candidate produced by classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingCandidate {
    pub deployment: DeploymentId,
    /// Classification weight (higher is better)
    pub weight: f64,
    pub priority: Priority,
    /// Parallel capacity configured for this model-provider pair, if known
    pub parallel_capacity: Option<usize>,
}

impl SchedulingCandidate {
    pub fn new(deployment: DeploymentId, weight: f64, priority: Priority) -> Self {
        Self { deployment, weight, priority, parallel_capacity: None }
    }

    pub fn with_parallel_capacity(mut self, capacity: usize) -> Self {
        self.parallel_capacity = Some(capacity);
        self
    }
}

/// Input to a scheduler
#[derive(Debug, Clone)]
pub struct SchedulingRequest {
    pub request_id: RequestId,
    pub candidates: Vec<SchedulingCandidate>,
    /// Caller payload, opaque to the scheduler
    pub payload: serde_json::Value,
    /// Maximum queue wait; the scheduler default applies when unset
    pub timeout: Option<Duration>,
}

impl SchedulingRequest {
    pub fn new(request_id: impl Into<RequestId>, candidates: Vec<SchedulingCandidate>) -> Self {
        Self {
            request_id: request_id.into(),
            candidates,
            payload: serde_json::Value::Null,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Candidates ordered by weight, highest first (stable on ties)
    pub fn ranked(&self) -> Vec<&SchedulingCandidate> {
        let mut ranked: Vec<&SchedulingCandidate> = self.candidates.iter().collect();
        ranked.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        ranked
    }
}

/// Provider-specific signals attached to a scheduling result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderMetrics {
    Local {
        available_vram_mb: u64,
    },
    Cloud {
        rate_limit_remaining_requests: Option<u64>,
        rate_limit_remaining_tokens: Option<u64>,
    },
}

/// Outcome of a successful scheduling decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingResult {
    pub deployment: DeploymentId,
    pub provider_kind: ProviderKind,
    pub was_queued: bool,
    /// Queue depth for the deployment when the request arrived
    pub queue_depth_at_schedule: usize,
    /// Active / parallel capacity at arrival; `None` where untracked (cloud)
    pub utilization_at_arrival: Option<f64>,
    pub provider_metrics: ProviderMetrics,
    pub priority: Priority,
    pub is_cold_start: bool,
}

/// Point-in-time view of a deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model_id: u64,
    pub provider_kind: ProviderKind,
    pub is_loaded: bool,
    /// VRAM used by the loaded model (local only)
    pub vram_mb: Option<u64>,
    /// When the provider will unload the model (local only)
    pub expires_at: Option<DateTime<Utc>>,
    /// Waiting requests by tier; `None` for providers without queue visibility
    pub queue_state: Option<QueueState>,
    pub active_requests: usize,
}

impl ModelStatus {
    /// Total waiting requests, zero when queue state is not visible
    pub fn queue_depth(&self) -> usize {
        self.queue_state.map(|q| q.total).unwrap_or(0)
    }
}

/// VRAM capacity of a local provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalCapacity {
    pub available_vram_mb: u64,
    pub total_vram_mb: u64,
    pub loaded_models: Vec<String>,
}

/// Rate-limit budget of a cloud deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudCapacity {
    pub remaining_requests: Option<u64>,
    pub total_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Providers do not report a usable reset time; always `None`
    pub reset_at: Option<DateTime<Utc>>,
    /// Age of the rate-limit snapshot, `None` if nothing was observed yet
    pub staleness: Option<Duration>,
    pub has_capacity: bool,
}

/// Capacity view, shaped by provider kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Capacity {
    Local(LocalCapacity),
    Cloud(CloudCapacity),
}

impl Capacity {
    /// Whether the provider can take another request right now.
    ///
    /// Local capacity is governed by reservations, so it always reports true here.
    pub fn has_capacity(&self) -> bool {
        match self {
            Capacity::Local(_) => true,
            Capacity::Cloud(cloud) => cloud.has_capacity,
        }
    }

    pub fn provider_metrics(&self) -> ProviderMetrics {
        match self {
            Capacity::Local(local) => {
                ProviderMetrics::Local { available_vram_mb: local.available_vram_mb }
            }
            Capacity::Cloud(cloud) => ProviderMetrics::Cloud {
                rate_limit_remaining_requests: cloud.remaining_requests,
                rate_limit_remaining_tokens: cloud.remaining_tokens,
            },
        }
    }
}

/// Per-request metrics reported on completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetrics {
    pub request_id: RequestId,
    /// Time between arrival and begin-processing, if processing began
    pub queue_wait: Option<Duration>,
    pub was_cold_start: bool,
    pub processing_time: Duration,
    pub queue_depth_at_arrival: usize,
    pub priority: Priority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::DEQUEUE_ORDER[0], Priority::High);
    }

    #[test]
    fn test_priority_from_level() {
        assert_eq!(Priority::from_level(1), Priority::Low);
        assert_eq!(Priority::from_level(3), Priority::Low);
        assert_eq!(Priority::from_level(5), Priority::Normal);
        assert_eq!(Priority::from_level(8), Priority::High);
        assert_eq!(Priority::from_level(10), Priority::High);
    }

    #[test]
    fn test_priority_promotion() {
        assert_eq!(Priority::Low.promoted(), Some(Priority::Normal));
        assert_eq!(Priority::Normal.promoted(), Some(Priority::High));
        assert_eq!(Priority::High.promoted(), None);
    }

    #[test]
    fn test_ranked_candidates() {
        let request = SchedulingRequest::new(
            "req-1",
            vec![
                SchedulingCandidate::new(DeploymentId::new(1, 1), 0.2, Priority::Normal),
                SchedulingCandidate::new(DeploymentId::new(2, 1), 0.9, Priority::Normal),
                SchedulingCandidate::new(DeploymentId::new(3, 1), 0.5, Priority::Normal),
            ],
        );

        let ranked: Vec<u64> = request.ranked().iter().map(|c| c.deployment.model_id).collect();
        assert_eq!(ranked, vec![2, 3, 1]);
    }

    #[test]
    fn test_capacity_helpers() {
        let cloud = Capacity::Cloud(CloudCapacity {
            remaining_requests: Some(5),
            total_requests: Some(100),
            remaining_tokens: None,
            total_tokens: None,
            reset_at: None,
            staleness: None,
            has_capacity: false,
        });
        assert!(!cloud.has_capacity());
        assert_eq!(
            cloud.provider_metrics(),
            ProviderMetrics::Cloud {
                rate_limit_remaining_requests: Some(5),
                rate_limit_remaining_tokens: None
            }
        );
    }

    #[test]
    fn test_deployment_display() {
        assert_eq!(DeploymentId::new(3, 9).to_string(), "3@9");
    }
}
