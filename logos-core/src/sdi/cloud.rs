//! Facade for cloud providers whose budget is reported in rate-limit headers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{RequestRecord, SchedulingDataInterface};
use crate::error::SdiError;
use crate::types::{
    Capacity, CloudCapacity, DeploymentMetadata, ModelStatus, Priority, ProviderKind, RequestId,
    RequestMetrics,
};

/// Remaining requests at or below which a deployment reports no capacity
pub const DEFAULT_CAPACITY_THRESHOLD: u64 = 10;

const REMAINING_REQUESTS: &str = "x-ratelimit-remaining-requests";
const REMAINING_TOKENS: &str = "x-ratelimit-remaining-tokens";
const LIMIT_REQUESTS: &str = "x-ratelimit-limit-requests";
const LIMIT_TOKENS: &str = "x-ratelimit-limit-tokens";

/// Provider-level configuration for a cloud provider
#[derive(Debug, Clone)]
pub struct CloudProviderConfig {
    pub provider_id: u64,
    pub name: String,
    pub capacity_threshold: u64,
}

impl CloudProviderConfig {
    pub fn new(provider_id: u64, name: impl Into<String>) -> Self {
        Self { provider_id, name: name.into(), capacity_threshold: DEFAULT_CAPACITY_THRESHOLD }
    }

    pub fn with_capacity_threshold(mut self, threshold: u64) -> Self {
        self.capacity_threshold = threshold;
        self
    }
}

/// Rate-limit values parsed from one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub limit_requests: Option<u64>,
    pub limit_tokens: Option<u64>,
}

impl RateLimitHeaders {
    /// Parse from header name/value pairs. Names match case-insensitively and
    /// unparseable values leave the field unknown.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut parsed = Self::default();

        for (name, value) in headers {
            let name = name.as_ref();
            let field = if name.eq_ignore_ascii_case(REMAINING_REQUESTS) {
                &mut parsed.remaining_requests
            } else if name.eq_ignore_ascii_case(REMAINING_TOKENS) {
                &mut parsed.remaining_tokens
            } else if name.eq_ignore_ascii_case(LIMIT_REQUESTS) {
                &mut parsed.limit_requests
            } else if name.eq_ignore_ascii_case(LIMIT_TOKENS) {
                &mut parsed.limit_tokens
            } else {
                continue;
            };

            match value.as_ref().trim().parse::<u64>() {
                Ok(v) => *field = Some(v),
                Err(_) => debug!(header = name, value = value.as_ref(), "Ignoring unparseable rate-limit header"),
            }
        }

        parsed
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
struct RateLimitSnapshot {
    headers: RateLimitHeaders,
    observed_at: DateTime<Utc>,
    observed: Instant,
}

#[derive(Debug, Clone)]
struct CloudModel {
    model_name: String,
    external_id: String,
}

#[derive(Debug, Default)]
struct CloudState {
    models: HashMap<u64, CloudModel>,
    limits: HashMap<String, RateLimitSnapshot>,
    requests: HashMap<RequestId, RequestRecord>,
}

impl CloudState {
    fn model(&self, model_id: u64, provider: &str) -> Result<&CloudModel, SdiError> {
        self.models.get(&model_id).ok_or_else(|| SdiError::unregistered(model_id, provider))
    }
}

/// SDI facade for one cloud provider
pub struct CloudFacade {
    config: CloudProviderConfig,
    state: Mutex<CloudState>,
}

impl CloudFacade {
    pub fn new(config: CloudProviderConfig) -> Self {
        Self { config, state: Mutex::new(CloudState::default()) }
    }

    pub fn config(&self) -> &CloudProviderConfig {
        &self.config
    }

    pub fn provider_id(&self) -> u64 {
        self.config.provider_id
    }

    /// External deployment id the provider knows the model by
    pub async fn external_id(&self, model_id: u64) -> Result<String, SdiError> {
        let state = self.state.lock().await;
        Ok(state.model(model_id, &self.config.name)?.external_id.clone())
    }

    /// Record rate-limit headers observed for a deployment.
    ///
    /// Returns false, leaving the snapshot untouched, when no field parsed.
    pub async fn update_rate_limits<I, K, V>(&self, external_id: &str, headers: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.record_rate_limits(external_id, RateLimitHeaders::from_headers(headers)).await
    }

    /// Record already-parsed rate limits for a deployment
    pub async fn record_rate_limits(&self, external_id: &str, headers: RateLimitHeaders) -> bool {
        if headers.is_empty() {
            return false;
        }

        let mut state = self.state.lock().await;
        state.limits.insert(
            external_id.to_string(),
            RateLimitSnapshot { headers, observed_at: Utc::now(), observed: Instant::now() },
        );

        debug!(
            provider = %self.config.name,
            deployment = external_id,
            remaining_requests = ?headers.remaining_requests,
            remaining_tokens = ?headers.remaining_tokens,
            "Rate limits updated"
        );
        true
    }

    /// Wall-clock time of the last snapshot for a deployment
    pub async fn last_observed(&self, external_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.limits.get(external_id).map(|s| s.observed_at)
    }

    fn has_capacity(&self, remaining_requests: Option<u64>) -> bool {
        remaining_requests.map_or(true, |remaining| remaining > self.config.capacity_threshold)
    }
}

#[async_trait]
impl SchedulingDataInterface for CloudFacade {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn provider_name(&self) -> &str {
        &self.config.name
    }

    async fn register_model(
        &self,
        model_id: u64,
        metadata: DeploymentMetadata,
    ) -> Result<(), SdiError> {
        if metadata.kind != ProviderKind::Cloud {
            return Err(SdiError::misconfigured(format!(
                "model {model_id} is a {} deployment, not cloud",
                metadata.kind
            )));
        }
        if metadata.deployment.provider_id != self.config.provider_id {
            return Err(SdiError::misconfigured(format!(
                "model {model_id} belongs to provider {}, not {}",
                metadata.deployment.provider_id, self.config.provider_id
            )));
        }

        let external_id = match metadata.external_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(SdiError::misconfigured(format!(
                    "cloud model {model_id} has no external deployment id"
                )))
            }
        };

        info!(
            provider = %self.config.name,
            model_id,
            model = %metadata.model_name,
            deployment = %external_id,
            "Registered cloud model"
        );

        self.state
            .lock()
            .await
            .models
            .insert(model_id, CloudModel { model_name: metadata.model_name, external_id });
        Ok(())
    }

    async fn get_model_status(&self, model_id: u64) -> Result<ModelStatus, SdiError> {
        let state = self.state.lock().await;
        state.model(model_id, &self.config.name)?;

        Ok(ModelStatus {
            model_id,
            provider_kind: ProviderKind::Cloud,
            is_loaded: true,
            vram_mb: None,
            expires_at: None,
            queue_state: None,
            active_requests: 0,
        })
    }

    async fn get_capacity_info(&self, model_id: u64) -> Result<Capacity, SdiError> {
        let state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;
        let snapshot = state.limits.get(&model.external_id);
        let headers = snapshot.map(|s| s.headers).unwrap_or_default();

        Ok(Capacity::Cloud(CloudCapacity {
            remaining_requests: headers.remaining_requests,
            total_requests: headers.limit_requests,
            remaining_tokens: headers.remaining_tokens,
            total_tokens: headers.limit_tokens,
            reset_at: None,
            staleness: snapshot.map(|s| s.observed.elapsed()),
            has_capacity: self.has_capacity(headers.remaining_requests),
        }))
    }

    async fn on_request_start(
        &self,
        request_id: &RequestId,
        model_id: u64,
        priority: Priority,
    ) -> Result<(), SdiError> {
        let mut state = self.state.lock().await;
        let model = state.model(model_id, &self.config.name)?;
        debug!(provider = %self.config.name, %request_id, model = %model.model_name, %priority, "Request arrived");

        if state.requests.contains_key(request_id) {
            return Err(SdiError::DuplicateRequest(request_id.clone()));
        }
        state.requests.insert(request_id.clone(), RequestRecord::new(model_id, priority, 0));
        Ok(())
    }

    async fn on_request_begin_processing(
        &self,
        request_id: &RequestId,
        _increment_active: bool,
    ) -> Result<(), SdiError> {
        let mut state = self.state.lock().await;
        let record = state
            .requests
            .get_mut(request_id)
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))?;
        record.started_at = Some(Instant::now());
        Ok(())
    }

    async fn on_request_complete(
        &self,
        request_id: &RequestId,
        was_cold_start: bool,
        duration: Duration,
        _reuse_slot: bool,
    ) -> Result<RequestMetrics, SdiError> {
        let record = self
            .state
            .lock()
            .await
            .requests
            .remove(request_id)
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))?;

        debug!(provider = %self.config.name, %request_id, model_id = record.model_id, "Request completed");
        Ok(record.into_metrics(request_id, was_cold_start, duration))
    }

    async fn on_request_cancelled(&self, request_id: &RequestId) -> Result<(), SdiError> {
        self.state
            .lock()
            .await
            .requests
            .remove(request_id)
            .map(|_| ())
            .ok_or_else(|| SdiError::UnknownRequest(request_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentId;

    async fn registered() -> CloudFacade {
        let facade = CloudFacade::new(CloudProviderConfig::new(2, "azure"));
        facade
            .register_model(20, DeploymentMetadata::cloud(DeploymentId::new(20, 2), "gpt-4o", "gpt4o-eu"))
            .await
            .unwrap();
        facade
    }

    async fn cloud_capacity(facade: &CloudFacade) -> CloudCapacity {
        match facade.get_capacity_info(20).await.unwrap() {
            Capacity::Cloud(capacity) => capacity,
            Capacity::Local(_) => panic!("expected cloud capacity"),
        }
    }

    #[test]
    fn test_parse_headers() {
        let parsed = RateLimitHeaders::from_headers([
            ("X-RateLimit-Remaining-Requests", "42"),
            ("x-ratelimit-remaining-tokens", " 9000 "),
            ("x-ratelimit-limit-requests", "100"),
            ("x-ratelimit-limit-tokens", "lots"),
            ("content-type", "application/json"),
        ]);

        assert_eq!(parsed.remaining_requests, Some(42));
        assert_eq!(parsed.remaining_tokens, Some(9000));
        assert_eq!(parsed.limit_requests, Some(100));
        assert_eq!(parsed.limit_tokens, None);
    }

    #[test]
    fn test_parse_no_rate_limit_headers() {
        let parsed = RateLimitHeaders::from_headers(vec![("server".to_string(), "nginx".to_string())]);
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn test_register_requires_external_id() {
        let facade = CloudFacade::new(CloudProviderConfig::new(2, "azure"));
        let mut metadata = DeploymentMetadata::cloud(DeploymentId::new(20, 2), "gpt-4o", "");
        assert!(matches!(
            facade.register_model(20, metadata.clone()).await,
            Err(SdiError::Misconfiguration(_))
        ));

        metadata.external_id = None;
        assert!(matches!(facade.register_model(20, metadata).await, Err(SdiError::Misconfiguration(_))));

        let local = DeploymentMetadata::local(DeploymentId::new(20, 2), "llama3.2:3b");
        assert!(matches!(facade.register_model(20, local).await, Err(SdiError::Misconfiguration(_))));
    }

    #[tokio::test]
    async fn test_unknown_budget_has_capacity() {
        let facade = registered().await;
        let capacity = cloud_capacity(&facade).await;

        assert!(capacity.has_capacity);
        assert_eq!(capacity.remaining_requests, None);
        assert_eq!(capacity.staleness, None);
        assert_eq!(capacity.reset_at, None);
    }

    #[tokio::test]
    async fn test_capacity_flips_at_threshold() {
        let facade = registered().await;

        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "11")]).await;
        assert!(cloud_capacity(&facade).await.has_capacity);

        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "10")]).await;
        assert!(!cloud_capacity(&facade).await.has_capacity);

        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "0")]).await;
        assert!(!cloud_capacity(&facade).await.has_capacity);

        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "100")]).await;
        let capacity = cloud_capacity(&facade).await;
        assert!(capacity.has_capacity);
        assert_eq!(capacity.remaining_requests, Some(100));
    }

    #[tokio::test]
    async fn test_custom_threshold() {
        let facade = CloudFacade::new(CloudProviderConfig::new(2, "azure").with_capacity_threshold(0));
        facade
            .register_model(20, DeploymentMetadata::cloud(DeploymentId::new(20, 2), "gpt-4o", "gpt4o-eu"))
            .await
            .unwrap();

        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "1")]).await;
        assert!(cloud_capacity(&facade).await.has_capacity);
    }

    #[tokio::test]
    async fn test_update_overwrites_snapshot() {
        let facade = registered().await;

        facade
            .update_rate_limits(
                "gpt4o-eu",
                [(REMAINING_REQUESTS, "50"), (REMAINING_TOKENS, "1000"), (LIMIT_TOKENS, "2000")],
            )
            .await;
        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "40")]).await;

        let capacity = cloud_capacity(&facade).await;
        assert_eq!(capacity.remaining_requests, Some(40));
        assert_eq!(capacity.remaining_tokens, None);
        assert_eq!(capacity.total_tokens, None);
    }

    #[tokio::test]
    async fn test_empty_update_is_noop() {
        let facade = registered().await;
        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "5")]).await;
        let observed = facade.last_observed("gpt4o-eu").await;

        assert!(!facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "n/a")]).await);
        assert_eq!(facade.last_observed("gpt4o-eu").await, observed);
        assert_eq!(cloud_capacity(&facade).await.remaining_requests, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_grows() {
        let facade = registered().await;
        facade.update_rate_limits("gpt4o-eu", [(REMAINING_REQUESTS, "500")]).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cloud_capacity(&facade).await.staleness, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_status_has_no_queue_visibility() {
        let facade = registered().await;
        let id = RequestId::from("req-1");
        facade.on_request_start(&id, 20, Priority::High).await.unwrap();
        facade.on_request_begin_processing(&id, true).await.unwrap();

        let status = facade.get_model_status(20).await.unwrap();
        assert_eq!(status.queue_state, None);
        assert_eq!(status.active_requests, 0);
        assert_eq!(status.provider_kind, ProviderKind::Cloud);

        let metrics = facade.on_request_complete(&id, false, Duration::from_secs(1), false).await.unwrap();
        assert_eq!(metrics.queue_depth_at_arrival, 0);
        assert_eq!(metrics.priority, Priority::High);
    }

    #[tokio::test]
    async fn test_external_id_lookup() {
        let facade = registered().await;
        assert_eq!(facade.external_id(20).await.unwrap(), "gpt4o-eu");
        assert!(matches!(facade.external_id(21).await, Err(SdiError::UnregisteredDeployment { .. })));
    }
}
