//! Utilization-aware policy
//!
//! Candidates are re-scored before admission:
//!
//! | deployment              | score                              |
//! |-------------------------|------------------------------------|
//! | local, model loaded     | weight + 10 - 0.5 x queue depth    |
//! | local, model cold       | weight - 20                        |
//! | cloud, has capacity     | weight + 5                         |
//! | cloud, budget exhausted | excluded                           |
//!
//! Admission then walks the scored list: local deployments must win a
//! reservation, cloud deployments are accepted as they stand.

use async_trait::async_trait;
use tracing::debug;

use super::{Scheduler, SchedulerCore};
use crate::error::SchedulingError;
use crate::sdi::{ProviderHandle, SchedulingDataInterface};
use crate::types::{SchedulingCandidate, SchedulingRequest, SchedulingResult};

const WARM_BONUS: f64 = 10.0;
const QUEUE_PENALTY: f64 = 0.5;
const COLD_PENALTY: f64 = 20.0;
const CLOUD_BONUS: f64 = 5.0;

/// Score of a local candidate
pub fn local_score(weight: f64, is_loaded: bool, queue_depth: usize) -> f64 {
    if is_loaded {
        weight + WARM_BONUS - QUEUE_PENALTY * queue_depth as f64
    } else {
        weight - COLD_PENALTY
    }
}

/// Score of a cloud candidate, `None` when it is out of budget
pub fn cloud_score(weight: f64, has_capacity: bool) -> Option<f64> {
    has_capacity.then_some(weight + CLOUD_BONUS)
}

/// Prefers warm local models and available cloud budget, penalising queues
/// and cold starts.
pub struct UtilizationScheduler {
    core: SchedulerCore,
}

impl UtilizationScheduler {
    pub fn new(core: SchedulerCore) -> Self {
        Self { core }
    }

    /// Candidates with their provider and score, best first
    async fn score<'a>(
        &self,
        request: &'a SchedulingRequest,
    ) -> Result<Vec<(&'a SchedulingCandidate, ProviderHandle, f64)>, SchedulingError> {
        let mut scored = Vec::with_capacity(request.candidates.len());

        for candidate in request.ranked() {
            let deployment = candidate.deployment;
            let Ok(handle) = self.core.registry().provider_for(&deployment).await else {
                debug!(request_id = %request.request_id, %deployment, "Skipping unregistered candidate");
                continue;
            };

            let score = match &handle {
                ProviderHandle::Local(local) => {
                    if let Some(limit) = candidate.parallel_capacity {
                        local.update_model_capacity(deployment.model_id, limit).await?;
                    }
                    let status = local.get_model_status(deployment.model_id).await?;
                    Some(local_score(candidate.weight, status.is_loaded, status.queue_depth()))
                }
                ProviderHandle::Cloud(cloud) => {
                    let capacity = cloud.get_capacity_info(deployment.model_id).await?;
                    cloud_score(candidate.weight, capacity.has_capacity())
                }
            };

            match score {
                Some(score) => scored.push((candidate, handle, score)),
                None => debug!(request_id = %request.request_id, %deployment, "Excluding cloud candidate without capacity"),
            }
        }

        // Stable: equal scores keep weight order
        scored.sort_by(|a, b| b.2.total_cmp(&a.2));
        Ok(scored)
    }
}

#[async_trait]
impl Scheduler for UtilizationScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "utilization"
    }

    async fn try_schedule_immediately(
        &self,
        request: &SchedulingRequest,
    ) -> Result<Option<SchedulingResult>, SchedulingError> {
        for (candidate, handle, score) in self.score(request).await? {
            debug!(request_id = %request.request_id, deployment = %candidate.deployment, score, "Trying candidate");
            if let Some(result) = self.core.try_admit(&request.request_id, candidate, &handle).await? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProviderRegistry;
    use crate::scheduler::{SchedulerConfig, SchedulerQueue};
    use crate::sdi::{
        CloudFacade, CloudProviderConfig, LoadedModel, LocalFacade, LocalProviderConfig,
        RateLimitHeaders,
    };
    use crate::types::{DeploymentId, DeploymentMetadata, Priority, ProviderKind};
    use std::sync::Arc;

    const WARM: DeploymentId = DeploymentId::new(1, 1);
    const COLD: DeploymentId = DeploymentId::new(2, 1);
    const CLOUD: DeploymentId = DeploymentId::new(3, 2);

    struct Fixture {
        scheduler: UtilizationScheduler,
        local: Arc<LocalFacade>,
        cloud: Arc<CloudFacade>,
    }

    async fn fixture() -> Fixture {
        let queue = Arc::new(SchedulerQueue::with_defaults());
        let local = Arc::new(
            LocalFacade::new(LocalProviderConfig::new(1, "ollama").with_total_vram_mb(32768))
                .with_queue_visibility(queue.clone()),
        );
        let cloud = Arc::new(CloudFacade::new(CloudProviderConfig::new(2, "azure")));

        let registry = Arc::new(ProviderRegistry::new());
        registry.add_provider(1, ProviderHandle::Local(local.clone())).await;
        registry.add_provider(2, ProviderHandle::Cloud(cloud.clone())).await;
        registry
            .register_deployment(DeploymentMetadata::local(WARM, "llama3.2:3b").with_parallel_capacity(1))
            .await
            .unwrap();
        registry.register_deployment(DeploymentMetadata::local(COLD, "qwen2.5:7b")).await.unwrap();
        registry.register_deployment(DeploymentMetadata::cloud(CLOUD, "gpt-4o", "gpt4o")).await.unwrap();

        local.record_loaded_models(vec![LoadedModel::new("llama3.2:3b", 2048 * 1024 * 1024)]).await;

        Fixture {
            scheduler: UtilizationScheduler::new(SchedulerCore::new(SchedulerConfig::default(), queue, registry)),
            local,
            cloud,
        }
    }

    #[test]
    fn test_scores() {
        assert_eq!(local_score(1.0, true, 0), 11.0);
        assert_eq!(local_score(1.0, true, 4), 9.0);
        assert_eq!(local_score(1.0, false, 0), -19.0);
        assert_eq!(cloud_score(1.0, true), Some(6.0));
        assert_eq!(cloud_score(1.0, false), None);
    }

    #[tokio::test]
    async fn test_warm_local_beats_cloud() {
        let f = fixture().await;
        let request = SchedulingRequest::new(
            "a",
            vec![
                SchedulingCandidate::new(CLOUD, 1.0, Priority::Normal),
                SchedulingCandidate::new(WARM, 0.5, Priority::Normal),
            ],
        );

        let result = f.scheduler.schedule(request).await.unwrap();
        assert_eq!(result.deployment, WARM);
        assert!(!result.is_cold_start);
        assert_eq!(f.local.active_requests(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cloud_beats_cold_local() {
        let f = fixture().await;
        let request = SchedulingRequest::new(
            "a",
            vec![
                SchedulingCandidate::new(COLD, 1.0, Priority::Normal),
                SchedulingCandidate::new(CLOUD, 0.5, Priority::Normal),
            ],
        );

        let result = f.scheduler.schedule(request).await.unwrap();
        assert_eq!(result.deployment, CLOUD);
        assert_eq!(result.provider_kind, ProviderKind::Cloud);
        assert_eq!(result.utilization_at_arrival, None);
    }

    #[tokio::test]
    async fn test_falls_through_busy_local() {
        let f = fixture().await;
        let candidates = vec![
            SchedulingCandidate::new(WARM, 1.0, Priority::Normal),
            SchedulingCandidate::new(COLD, 0.5, Priority::Normal),
        ];

        let first = f.scheduler.schedule(SchedulingRequest::new("a", candidates.clone())).await.unwrap();
        assert_eq!(first.deployment, WARM);

        // WARM is at capacity 1, so the cold model is next in line
        let second = f.scheduler.schedule(SchedulingRequest::new("b", candidates)).await.unwrap();
        assert_eq!(second.deployment, COLD);
        assert!(second.is_cold_start);
    }

    #[tokio::test]
    async fn test_exhausted_cloud_excluded() {
        let f = fixture().await;
        f.cloud
            .record_rate_limits("gpt4o", RateLimitHeaders { remaining_requests: Some(3), ..Default::default() })
            .await;

        let request = SchedulingRequest::new(
            "a",
            vec![
                SchedulingCandidate::new(CLOUD, 5.0, Priority::Normal),
                SchedulingCandidate::new(COLD, 0.1, Priority::Normal),
            ],
        );

        let result = f.scheduler.schedule(request).await.unwrap();
        assert_eq!(result.deployment, COLD);
    }
}
