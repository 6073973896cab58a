//! Gateway assembly: facades, registry, scheduler and pipeline from one config.

use std::sync::Arc;

use logos_adapters_ollama::OllamaClient;
use logos_core::{
    CloudFacade, CloudProviderConfig, DeploymentMetadata, FirstCandidateScheduler, LoadedModelSource,
    LocalFacade, LocalProviderConfig, ProviderHandle, ProviderRegistry, Scheduler, SchedulerCore,
    SchedulerQueue, SchedulerStats, UtilizationScheduler,
};
use tracing::info;

use crate::collaborators::{Classifier, ContextResolver, Monitor};
use crate::config::{GatewayConfig, SchedulerKind};
use crate::monitor::TracingMonitor;
use crate::pipeline::Pipeline;

enum PendingProvider {
    Ollama { provider_id: u64, name: String, total_vram_mb: u64 },
    Local { config: LocalProviderConfig, source: Option<Arc<dyn LoadedModelSource>> },
    Cloud { provider_id: u64, name: String },
}

/// An assembled gateway
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ProviderRegistry>,
    queue: Arc<SchedulerQueue>,
    pipeline: Pipeline,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<SchedulerQueue> {
        &self.queue
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.pipeline.scheduler().core().stats().await
    }
}

/// Builder for [`Gateway`]
#[derive(Default)]
pub struct GatewayBuilder {
    config: Option<GatewayConfig>,
    providers: Vec<PendingProvider>,
    deployments: Vec<DeploymentMetadata>,
    classifier: Option<Arc<dyn Classifier>>,
    resolver: Option<Arc<dyn ContextResolver>>,
    monitor: Option<Arc<dyn Monitor>>,
}

impl GatewayBuilder {
    /// Use `config` instead of [`GatewayConfig::from_env`]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Add an Ollama server at the configured `OLLAMA_HOST`, polled over HTTP
    pub fn ollama_provider(mut self, provider_id: u64, name: impl Into<String>, total_vram_mb: u64) -> Self {
        self.providers.push(PendingProvider::Ollama { provider_id, name: name.into(), total_vram_mb });
        self
    }

    /// Add a local provider with an explicit loaded-model source
    pub fn local_provider(
        mut self,
        config: LocalProviderConfig,
        source: Option<Arc<dyn LoadedModelSource>>,
    ) -> Self {
        self.providers.push(PendingProvider::Local { config, source });
        self
    }

    /// Add a cloud provider; its exhaustion threshold comes from the scheduler config
    pub fn cloud_provider(mut self, provider_id: u64, name: impl Into<String>) -> Self {
        self.providers.push(PendingProvider::Cloud { provider_id, name: name.into() });
        self
    }

    pub fn deployment(mut self, metadata: DeploymentMetadata) -> Self {
        self.deployments.push(metadata);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn ContextResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Defaults to [`TracingMonitor`]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Validate the configuration, register every provider and deployment,
    /// and wire the selected scheduler into a pipeline.
    pub async fn build(self) -> anyhow::Result<Gateway> {
        let config = self.config.unwrap_or_else(GatewayConfig::from_env);
        config.validate()?;
        let kind = config.scheduler_kind()?;

        let classifier = self.classifier.ok_or_else(|| anyhow::anyhow!("a classifier is required"))?;
        let resolver = self.resolver.ok_or_else(|| anyhow::anyhow!("a context resolver is required"))?;
        let monitor = self.monitor.unwrap_or_else(|| Arc::new(TracingMonitor));

        let queue = Arc::new(SchedulerQueue::new(config.queue.clone()));
        let registry = Arc::new(ProviderRegistry::new());

        for pending in self.providers {
            let (provider_id, handle) = match pending {
                PendingProvider::Ollama { provider_id, name, total_vram_mb } => {
                    let client = OllamaClient::from_config(&config.ollama, name.clone())?;
                    let mut local = LocalProviderConfig::new(provider_id, name)
                        .with_base_url(config.ollama.base_url())
                        .with_total_vram_mb(total_vram_mb)
                        .with_refresh_interval(config.poll_interval);
                    local.parallel_capacity = config.ollama.parallel_capacity();

                    let facade = LocalFacade::new(local)
                        .with_source(Arc::new(client))
                        .with_queue_visibility(queue.clone());
                    (provider_id, ProviderHandle::Local(Arc::new(facade)))
                }
                PendingProvider::Local { config: local, source } => {
                    let mut facade = LocalFacade::new(local).with_queue_visibility(queue.clone());
                    if let Some(source) = source {
                        facade = facade.with_source(source);
                    }
                    (facade.provider_id(), ProviderHandle::Local(Arc::new(facade)))
                }
                PendingProvider::Cloud { provider_id, name } => {
                    let cloud = CloudProviderConfig::new(provider_id, name)
                        .with_capacity_threshold(config.scheduler.cloud_capacity_threshold);
                    (provider_id, ProviderHandle::Cloud(Arc::new(CloudFacade::new(cloud))))
                }
            };
            registry.add_provider(provider_id, handle).await;
        }

        for metadata in self.deployments {
            registry.register_deployment(metadata).await?;
        }

        let core = SchedulerCore::new(config.scheduler.clone(), queue.clone(), registry.clone());
        let scheduler: Arc<dyn Scheduler> = match kind {
            SchedulerKind::Utilization => Arc::new(UtilizationScheduler::new(core)),
            SchedulerKind::FirstCandidate => Arc::new(FirstCandidateScheduler::new(core)),
        };

        info!(
            scheduler = scheduler.name(),
            providers = registry.providers().await.len(),
            deployments = registry.deployments().await.len(),
            "Gateway ready"
        );

        let pipeline = Pipeline::new(classifier, scheduler, resolver, monitor);
        Ok(Gateway { config, registry, queue, pipeline })
    }
}
