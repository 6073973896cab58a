//! Facade for locally hosted providers (Ollama-style).
//!
//! Availability is computed, not reported: `total - sum(loaded model VRAM)`
//! over a polled snapshot of resident models. Concurrency is bounded per model
//! by a parallel capacity resolved from the model override, then the provider
//! config, then [`DEFAULT_PARALLEL_CAPACITY`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LoadedModel, LoadedModelSource, RequestRecord, SchedulingDataInterface};
use crate::error::SdiError;
use crate::queue::{QueueState, QueueVisibility};
use crate::types::{
    Capacity, DeploymentId, DeploymentMetadata, LocalCapacity, ModelStatus, Priority,
    ProviderKind, RequestId, RequestMetrics,
};

/// Parallel capacity when neither the model nor the provider configures one.
/// Matches Ollama's default `OLLAMA_NUM_PARALLEL`.
pub const DEFAULT_PARALLEL_CAPACITY: usize = 4;

/// Provider-level configuration for a local provider
#[derive(Debug, Clone)]
pub struct LocalProviderConfig {
    pub provider_id: u64,

    /// Provider name used in logs
    pub name: String,

    /// Base URL of the provider API
    pub base_url: String,

    /// Total VRAM in MB; deployments may supply it at registration instead
    pub total_vram_mb: Option<u64>,

    /// Provider-wide parallel capacity
    pub parallel_capacity: Option<usize>,

    /// Minimum age of the loaded-model snapshot before polling again
    pub refresh_interval: Duration,
}

impl LocalProviderConfig {
    pub fn new(provider_id: u64, name: impl Into<String>) -> Self {
        Self {
            provider_id,
            name: name.into(),
            base_url: "http://localhost:11434".to_string(),
            total_vram_mb: None,
            parallel_capacity: None,
            refresh_interval: Duration::from_secs(5),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_total_vram_mb(mut self, total_vram_mb: u64) -> Self {
        self.total_vram_mb = Some(total_vram_mb);
        self
    }

    pub fn with_parallel_capacity(mut self, capacity: usize) -> Self {
        self.parallel_capacity = Some(capacity);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct LocalModel {
    model_name: String,
    parallel_override: Option<usize>,
}

#[derive(Debug, Default)]
struct LocalState {
    models: HashMap<u64, LocalModel>,
    total_vram_mb: Option<u64>,
    snapshot: Vec<LoadedModel>,
    snapshot_at: Option<Instant>,
    polled_at: Option<Instant>,
    active: HashMap<u64, usize>,
    requests: HashMap<RequestId, RequestRecord>,
}

impl LocalState {
    fn model(&self, model_id: u64, provider: &str) -> Result<&LocalModel, SdiError> {
        self.models.get(&model_id).ok_or_else(|| SdiError::unregistered(model_id, provider))
    }

    fn active(&self, model_id: u64) -> usize {
        self.active.get(&model_id).copied().unwrap_or(0)
    }
}

/// Provider-reported names carry a tag; an untagged name means `:latest`
fn names_match(registered: &str, reported: &str) -> bool {
    if registered == reported {
        return true;
    }
    match (registered.split_once(':'), reported.split_once(':')) {
        (None, Some((name, "latest"))) => name == registered,
        (Some((name, "latest")), None) => name == reported,
        _ => false,
    }
}

/// SDI facade for one local provider
pub struct LocalFacade {
    config: LocalProviderConfig,
    source: Option<Arc<dyn LoadedModelSource>>,
    queues: Option<Arc<dyn QueueVisibility>>,
    state: Mutex<LocalState>,
}

impl LocalFacade {
    /// Create a facade with no polling source and no queue visibility
    pub fn new(config: LocalProviderConfig) -> Self {
        let state = LocalState { total_vram_mb: config.total_vram_mb, ..Default::default() };
        Self { config, source: None, queues: None, state: Mutex::new(state) }
    }

    /// Poll loaded models from `source`
    pub fn with_source(mut self, source: Arc<dyn LoadedModelSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Report queue depth from `queues`
    pub fn with_queue_visibility(mut self, queues: Arc<dyn QueueVisibility>) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn config(&self) -> &LocalProviderConfig {
        &self.config
    }

    pub fn provider_id(&self) -> u64 {
        self.config.provider_id
    }

    fn deployment(&self, model_id: u64) -> DeploymentId {
        DeploymentId::new(model_id, self.config.provider_id)
    }

    fn limit_for(&self, model: &LocalModel) -> usize {
        model
            .parallel_override
            .or(self.config.parallel_capacity)
            .unwrap_or(DEFAULT_PARALLEL_CAPACITY)
    }

    async fn queue_state(&self, model_id: u64) -> QueueState {
        match &self.queues {
            Some(queues) => queues.queue_state(self.deployment(model_id)).await,
            None => QueueState::default(),
        }
    }

    /// Replace the loaded-model snapshot
    pub async fn record_loaded_models(&self, models: Vec<LoadedModel>) {
        let mut state = self.state.lock().await;
        debug!(provider = %self.config.name, count = models.len(), "Loaded models updated");
        state.snapshot = models;
        state.snapshot_at = Some(Instant::now());
    }

    /// Age of the last successful snapshot
    pub async fn snapshot_age(&self) -> Option<Duration> {
        self.state.lock().await.snapshot_at.map(|at| at.elapsed())
    }

    /// Poll the source now, regardless of the refresh interval
    pub async fn poll_now(&self) -> Result<(), SdiError> {
        if self.source.is_none() {
            return Ok(());
        }
        self.state.lock().await.polled_at = Some(Instant::now());
        self.poll_source().await
    }

    async fn poll_source(&self) -> Result<(), SdiError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let models = source.loaded_models().await?;
        self.record_loaded_models(models).await;
        Ok(())
    }

    /// Poll unless the last attempt is younger than the refresh interval.
    ///
    /// Concurrent callers share one poll. Failures are logged and the
    /// previous snapshot keeps serving reads.
    pub async fn refresh_if_stale(&self) {
        if self.source.is_none() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            if let Some(polled_at) = state.polled_at {
                if polled_at.elapsed() < self.config.refresh_interval {
                    return;
                }
            }
            state.polled_at = Some(Instant::now());
        }

        if let Err(e) = self.poll_source().await {
            warn!(
                provider = %self.config.name,
                error = %e,
                "Loaded-model poll failed, serving last known snapshot"
            );
        }
    }

    /// Atomically claim one unit of the model's parallel capacity
    pub async fn try_reserve_capacity(&self, model_id: u64) -> Result<bool, SdiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let model = state.model(model_id, &self.config.name)?;
        let limit = self.limit_for(model);
        let active = state.active.entry(model_id).or_insert(0);

        if *active >= limit {
            debug!(provider = %self.config.name, model_id, active = *active, limit, "Reservation refused");
            return Ok(false);
        }

        *active += 1;
        debug!(provider = %self.config.name, model_id, active = *active, limit, "Capacity reserved");
        Ok(true)
    }

    /// Give back a reserved slot that never became a tracked request
    pub async fn release_capacity(&self, model_id: u64) -> Result<(), SdiError> {
        let mut state = self.state.lock().await;
        state.model(model_id, &self.config.name)?;

        if let Some(active) = state.active.get_mut(&model_id) {
            *active = active.saturating_sub(1);
        }
        Ok(())
    }

    /// Refresh the per-model parallel capacity
    pub async fn update_model_capacity(&self, model_id: u64, limit: usize) -> Result<(), SdiError> {
        if limit == 0 {
            return Err(SdiError::misconfigured(format!(
                "parallel capacity for model {model_id} must be at least 1"
            )));
        }

        let mut state = self.state.lock().await;
        let model = state
            .models
            .get_mut(&model_id)
            .ok_or_else(|| SdiError::unregistered(model_id, &self.config.name))?;

        if model.parallel_override != Some(limit) {
            debug!(provider = %self.config.name, model_id, limit, "Parallel capacity updated");
            model.parallel_override = Some(limit);
        }
        Ok(())
    }

    /// Whether a model holds more slots than its current limit allows.
    ///
    /// Happens after the limit is lowered below the active count; such a
    /// model sheds slots on completion instead of handing them off.
    pub async fn is_over_limit(&self, model_id: u64) -> Result<bool, SdiError> {
        let state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;
        Ok(state.active(model_id) > self.limit_for(model))
    }

    /// Resolved parallel capacity for a model
    pub async fn capacity_limit(&self, model_id: u64) -> Result<usize, SdiError> {
        let state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;
        Ok(self.limit_for(model))
    }

    /// Requests currently holding a slot
    pub async fn active_requests(&self, model_id: u64) -> Result<usize, SdiError> {
        let state = self.state.lock().await;
        state.model(model_id, &self.config.name)?;
        Ok(state.active(model_id))
    }

    /// Active requests as a fraction of parallel capacity
    pub async fn utilization(&self, model_id: u64) -> Result<f64, SdiError> {
        let state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;
        Ok(state.active(model_id) as f64 / self.limit_for(model) as f64)
    }
}

#[async_trait]
impl SchedulingDataInterface for LocalFacade {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn provider_name(&self) -> &str {
        &self.config.name
    }

    async fn register_model(
        &self,
        model_id: u64,
        metadata: DeploymentMetadata,
    ) -> Result<(), SdiError> {
        if metadata.kind != ProviderKind::Local {
            return Err(SdiError::misconfigured(format!(
                "model {model_id} is a {} deployment, not local",
                metadata.kind
            )));
        }
        if metadata.deployment.provider_id != self.config.provider_id {
            return Err(SdiError::misconfigured(format!(
                "model {model_id} belongs to provider {}, not {}",
                metadata.deployment.provider_id, self.config.provider_id
            )));
        }
        if metadata.model_name.trim().is_empty() {
            return Err(SdiError::misconfigured(format!("model {model_id} has no model name")));
        }
        if metadata.parallel_capacity == Some(0) {
            return Err(SdiError::misconfigured(format!(
                "parallel capacity for model {model_id} must be at least 1"
            )));
        }

        let mut state = self.state.lock().await;

        let total_vram_mb = metadata.total_vram_mb.or(state.total_vram_mb);
        match total_vram_mb {
            None | Some(0) => {
                return Err(SdiError::misconfigured(format!(
                    "no total VRAM configured for local provider '{}'",
                    self.config.name
                )));
            }
            Some(total) => state.total_vram_mb = Some(total),
        }

        state.models.insert(
            model_id,
            LocalModel {
                model_name: metadata.model_name.clone(),
                parallel_override: metadata.parallel_capacity,
            },
        );
        state.active.entry(model_id).or_insert(0);

        info!(
            provider = %self.config.name,
            model_id,
            model = %metadata.model_name,
            total_vram_mb = ?total_vram_mb,
            "Registered local model"
        );
        Ok(())
    }

    async fn get_model_status(&self, model_id: u64) -> Result<ModelStatus, SdiError> {
        self.refresh_if_stale().await;
        let queue_state = self.queue_state(model_id).await;

        let state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;

        let resident = state.snapshot.iter().find(|m| names_match(&model.model_name, &m.name));
        let is_loaded = resident.is_some_and(|m| !m.is_expired(Utc::now()));

        Ok(ModelStatus {
            model_id,
            provider_kind: ProviderKind::Local,
            is_loaded,
            vram_mb: resident.map(LoadedModel::vram_mb),
            expires_at: resident.and_then(|m| m.expires_at),
            queue_state: Some(queue_state),
            active_requests: state.active(model_id),
        })
    }

    async fn get_capacity_info(&self, model_id: u64) -> Result<Capacity, SdiError> {
        self.refresh_if_stale().await;

        let state = self.state.lock().await;
        state.model(model_id, &self.config.name)?;

        let now = Utc::now();
        let resident: Vec<&LoadedModel> =
            state.snapshot.iter().filter(|m| !m.is_expired(now)).collect();
        let used_bytes: u64 = resident.iter().map(|m| m.size_vram).sum();
        let total_vram_mb = state.total_vram_mb.unwrap_or(0);

        Ok(Capacity::Local(LocalCapacity {
            available_vram_mb: total_vram_mb.saturating_sub(used_bytes / (1024 * 1024)),
            total_vram_mb,
            loaded_models: resident.iter().map(|m| m.name.clone()).collect(),
        }))
    }

    async fn on_request_start(
        &self,
        request_id: &RequestId,
        model_id: u64,
        priority: Priority,
    ) -> Result<(), SdiError> {
        let depth = self.queue_state(model_id).await.total;

        let mut state = self.state.lock().await;
        state.model(model_id, &self.config.name)?;
        if state.requests.contains_key(request_id) {
            return Err(SdiError::DuplicateRequest(request_id.clone()));
        }

        state.requests.insert(request_id.clone(), RequestRecord::new(model_id, priority, depth));
        debug!(provider = %self.config.name, %request_id, model_id, %priority, queue_depth = depth, "Request arrived");
        Ok(())
    }

    async fn on_request_begin_processing(
        &self,
        request_id: &RequestId,
        increment_active: bool,
    ) -> Result<(), SdiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let model_id = state
            .requests
            .get(request_id)
            .map(|record| record.model_id)
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))?;

        if increment_active {
            let limit = self.limit_for(state.model(model_id, &self.config.name)?);
            let active = state.active.entry(model_id).or_insert(0);
            if *active >= limit {
                return Err(SdiError::CapacityExhausted { model_id, limit });
            }
            *active += 1;
        }

        if let Some(record) = state.requests.get_mut(request_id) {
            record.started_at = Some(Instant::now());
        }

        debug!(provider = %self.config.name, %request_id, model_id, increment_active, "Processing started");
        Ok(())
    }

    async fn on_request_complete(
        &self,
        request_id: &RequestId,
        was_cold_start: bool,
        duration: Duration,
        reuse_slot: bool,
    ) -> Result<RequestMetrics, SdiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let record = state
            .requests
            .remove(request_id)
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))?;

        if !reuse_slot {
            if let Some(active) = state.active.get_mut(&record.model_id) {
                *active = active.saturating_sub(1);
            }
        }

        debug!(
            provider = %self.config.name,
            %request_id,
            model_id = record.model_id,
            reuse_slot,
            active = state.active(record.model_id),
            "Request completed"
        );

        Ok(record.into_metrics(request_id, was_cold_start, duration))
    }

    async fn on_request_cancelled(&self, request_id: &RequestId) -> Result<(), SdiError> {
        let mut state = self.state.lock().await;
        state
            .requests
            .remove(request_id)
            .map(|_| ())
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))
    }
}
