//! Request/response types at the pipeline boundary and the external
//! collaborators the pipeline drives.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use logos_core::{
    DeploymentId, RequestId, RequestMetrics, SchedulerStats, SchedulingCandidate, SchedulingResult,
};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Who is calling, as established by the authentication layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerContext {
    pub caller_id: Option<String>,

    pub roles: Vec<String>,

    /// Free-form attributes forwarded to classification and resolution
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl CallerContext {
    pub fn new(caller_id: impl Into<String>) -> Self {
        Self { caller_id: Some(caller_id.into()), ..Default::default() }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Routing policy; opaque to the pipeline, interpreted by the classifier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy(serde_json::Value);

impl Policy {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Look up a top-level policy field
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

/// A request entering the pipeline
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Generated when absent
    pub request_id: Option<RequestId>,
    pub payload: serde_json::Value,
    pub caller: CallerContext,
    pub policy: Policy,
    /// Maximum queue wait; the scheduler default applies when unset
    pub timeout: Option<Duration>,
}

impl PipelineRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            request_id: None,
            payload,
            caller: CallerContext::default(),
            policy: Policy::default(),
            timeout: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where and how to send the request once a deployment is chosen
#[derive(Clone, PartialEq, Serialize)]
pub struct RoutingContext {
    pub deployment: DeploymentId,
    pub endpoint: String,
    pub model_name: String,

    /// Credential for the provider; never serialized
    #[serde(skip_serializing)]
    pub auth: Option<String>,
}

impl fmt::Debug for RoutingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingContext")
            .field("deployment", &self.deployment)
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Successful pipeline outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dispatch {
    pub request_id: RequestId,
    pub scheduling: SchedulingResult,
    pub routing: RoutingContext,
}

/// Ranks the deployments able to serve a request
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Candidates with weights and priority; empty means nothing qualifies
    async fn classify(&self, request: &PipelineRequest) -> anyhow::Result<Vec<SchedulingCandidate>>;
}

/// Produces endpoint and credentials for the chosen deployment
#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn resolve(
        &self,
        request: &PipelineRequest,
        scheduling: &SchedulingResult,
    ) -> anyhow::Result<RoutingContext>;
}

/// Receives pipeline events. Every method defaults to a no-op.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn on_enqueued(&self, _request_id: &RequestId, _candidates: &[SchedulingCandidate]) {}

    async fn on_scheduled(&self, _request_id: &RequestId, _scheduling: &SchedulingResult) {}

    async fn on_completed(&self, _deployment: DeploymentId, _metrics: &RequestMetrics) {}

    async fn on_failed(&self, _request_id: &RequestId, _error: &PipelineError) {}

    /// Scheduler load after a grant or release
    async fn on_load(&self, _stats: SchedulerStats) {}
}
