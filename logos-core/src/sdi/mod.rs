//! Scheduling Data Interface (SDI)
//!
//! Facades exposing real-time capacity and load signals per deployment, one
//! implementation per provider kind:
//!
//! - [`LocalFacade`]: VRAM-bound providers polled for their loaded models,
//!   with an active-request counter and atomic capacity reservation.
//! - [`CloudFacade`]: remote APIs whose budget is learned from rate-limit
//!   response headers. No queue visibility and no local concurrency tracking.
//!
//! The provider kind is fixed at registration and carried as a
//! [`ProviderHandle`] so the hot path never branches on strings.

mod cloud;
mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::SdiError;
use crate::types::{
    Capacity, DeploymentMetadata, ModelStatus, Priority, ProviderKind, RequestId, RequestMetrics,
};

pub use cloud::{CloudFacade, CloudProviderConfig, RateLimitHeaders, DEFAULT_CAPACITY_THRESHOLD};
pub use local::{LocalFacade, LocalProviderConfig, DEFAULT_PARALLEL_CAPACITY};

/// Contract shared by every provider facade
#[async_trait]
pub trait SchedulingDataInterface: Send + Sync {
    /// Provider kind served by this facade
    fn kind(&self) -> ProviderKind;

    /// Human-readable provider name, used in logs and errors
    fn provider_name(&self) -> &str;

    /// Register a model hosted by this provider
    async fn register_model(
        &self,
        model_id: u64,
        metadata: DeploymentMetadata,
    ) -> Result<(), SdiError>;

    /// Point-in-time status of a registered model
    async fn get_model_status(&self, model_id: u64) -> Result<ModelStatus, SdiError>;

    /// Capacity view for the provider (local) or deployment (cloud) serving `model_id`
    async fn get_capacity_info(&self, model_id: u64) -> Result<Capacity, SdiError>;

    /// A request targeting `model_id` arrived
    async fn on_request_start(
        &self,
        request_id: &RequestId,
        model_id: u64,
        priority: Priority,
    ) -> Result<(), SdiError>;

    /// Processing begins; `increment_active` is false when a reservation already counted it
    async fn on_request_begin_processing(
        &self,
        request_id: &RequestId,
        increment_active: bool,
    ) -> Result<(), SdiError>;

    /// Processing finished; with `reuse_slot` the slot passes to the next waiter untouched
    async fn on_request_complete(
        &self,
        request_id: &RequestId,
        was_cold_start: bool,
        duration: Duration,
        reuse_slot: bool,
    ) -> Result<RequestMetrics, SdiError>;

    /// Drop the lifecycle record of a request that left the queue without running
    async fn on_request_cancelled(&self, request_id: &RequestId) -> Result<(), SdiError>;
}

/// One model resident on a local provider, as reported by its polling endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub name: String,
    /// VRAM held by the model in bytes
    pub size_vram: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl LoadedModel {
    pub fn new(name: impl Into<String>, size_vram: u64) -> Self {
        Self { name: name.into(), size_vram, expires_at: None }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// VRAM held by the model in MB
    pub fn vram_mb(&self) -> u64 {
        self.size_vram / (1024 * 1024)
    }

    /// Whether the provider has (or will have by `now`) unloaded the model
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Source of loaded-model snapshots for a local provider
#[async_trait]
pub trait LoadedModelSource: Send + Sync {
    async fn loaded_models(&self) -> Result<Vec<LoadedModel>, SdiError>;
}

/// Lifecycle record kept between `on_request_start` and `on_request_complete`
#[derive(Debug, Clone)]
pub(crate) struct RequestRecord {
    pub model_id: u64,
    pub priority: Priority,
    pub arrived_at: Instant,
    pub started_at: Option<Instant>,
    pub queue_depth_at_arrival: usize,
}

impl RequestRecord {
    pub fn new(model_id: u64, priority: Priority, queue_depth_at_arrival: usize) -> Self {
        Self { model_id, priority, arrived_at: Instant::now(), started_at: None, queue_depth_at_arrival }
    }

    pub fn into_metrics(
        self,
        request_id: &RequestId,
        was_cold_start: bool,
        duration: Duration,
    ) -> RequestMetrics {
        RequestMetrics {
            request_id: request_id.clone(),
            queue_wait: self.started_at.map(|started| started - self.arrived_at),
            was_cold_start,
            processing_time: duration,
            queue_depth_at_arrival: self.queue_depth_at_arrival,
            priority: self.priority,
        }
    }
}

/// A facade selected by provider kind at registration time
#[derive(Clone)]
pub enum ProviderHandle {
    Local(Arc<LocalFacade>),
    Cloud(Arc<CloudFacade>),
}

impl ProviderHandle {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderHandle::Local(_) => ProviderKind::Local,
            ProviderHandle::Cloud(_) => ProviderKind::Cloud,
        }
    }

    /// The facade behind this handle, through the shared contract
    pub fn sdi(&self) -> &dyn SchedulingDataInterface {
        match self {
            ProviderHandle::Local(local) => local.as_ref(),
            ProviderHandle::Cloud(cloud) => cloud.as_ref(),
        }
    }

    pub fn as_local(&self) -> Option<&Arc<LocalFacade>> {
        match self {
            ProviderHandle::Local(local) => Some(local),
            ProviderHandle::Cloud(_) => None,
        }
    }

    pub fn as_cloud(&self) -> Option<&Arc<CloudFacade>> {
        match self {
            ProviderHandle::Cloud(cloud) => Some(cloud),
            ProviderHandle::Local(_) => None,
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(match self {
            ProviderHandle::Local(_) => "Local",
            ProviderHandle::Cloud(_) => "Cloud",
        })
        .field(&self.sdi().provider_name())
        .finish()
    }
}
