//! Provider and deployment registry
//!
//! Maps provider ids to their facade and deployments to the provider kind
//! they were registered with. The kind is fixed at registration: a
//! deployment cannot move between a local and a cloud facade.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::SdiError;
use crate::sdi::ProviderHandle;
use crate::types::{DeploymentId, DeploymentMetadata, ProviderKind};

#[derive(Debug, Default)]
struct RegistryInner {
    providers: HashMap<u64, ProviderHandle>,
    deployments: HashMap<DeploymentId, ProviderKind>,
}

/// Registry of provider facades and the deployments they host
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the facade serving `provider_id`
    pub async fn add_provider(&self, provider_id: u64, handle: ProviderHandle) {
        info!(provider_id, kind = %handle.kind(), name = handle.sdi().provider_name(), "Provider added");
        self.inner.write().await.providers.insert(provider_id, handle);
    }

    /// Register a deployment with the facade of its provider
    pub async fn register_deployment(&self, metadata: DeploymentMetadata) -> Result<(), SdiError> {
        let deployment = metadata.deployment;

        let handle = {
            let inner = self.inner.read().await;
            let handle = inner.providers.get(&deployment.provider_id).cloned().ok_or_else(|| {
                SdiError::misconfigured(format!("provider {} is not configured", deployment.provider_id))
            })?;

            if handle.kind() != metadata.kind {
                return Err(SdiError::misconfigured(format!(
                    "deployment {deployment} is {} but provider {} is {}",
                    metadata.kind,
                    deployment.provider_id,
                    handle.kind()
                )));
            }
            if let Some(existing) = inner.deployments.get(&deployment) {
                if *existing != metadata.kind {
                    return Err(SdiError::misconfigured(format!(
                        "deployment {deployment} is already registered as {existing}"
                    )));
                }
            }
            handle
        };

        handle.sdi().register_model(deployment.model_id, metadata).await?;
        self.inner.write().await.deployments.insert(deployment, handle.kind());
        Ok(())
    }

    /// Facade serving a registered deployment
    pub async fn provider_for(&self, deployment: &DeploymentId) -> Result<ProviderHandle, SdiError> {
        let inner = self.inner.read().await;
        let unregistered = || {
            let provider = inner
                .providers
                .get(&deployment.provider_id)
                .map(|h| h.sdi().provider_name().to_string())
                .unwrap_or_else(|| deployment.provider_id.to_string());
            SdiError::unregistered(deployment.model_id, provider)
        };

        if !inner.deployments.contains_key(deployment) {
            return Err(unregistered());
        }
        inner.providers.get(&deployment.provider_id).cloned().ok_or_else(unregistered)
    }

    /// Whether `deployment` was registered
    pub async fn is_registered(&self, deployment: &DeploymentId) -> bool {
        self.inner.read().await.deployments.contains_key(deployment)
    }

    /// All registered deployments with their provider kind
    pub async fn deployments(&self) -> Vec<(DeploymentId, ProviderKind)> {
        let mut deployments: Vec<_> =
            self.inner.read().await.deployments.iter().map(|(d, k)| (*d, *k)).collect();
        deployments.sort_by_key(|(deployment, _)| *deployment);
        deployments
    }

    /// Configured providers
    pub async fn providers(&self) -> Vec<ProviderHandle> {
        self.inner.read().await.providers.values().cloned().collect()
    }
}
