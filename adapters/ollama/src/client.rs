//! Loaded-model polling against Ollama's `GET /api/ps`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logos_core::{LoadedModel, LoadedModelSource, SdiError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::OllamaConfig;

/// Response body of `GET /api/ps`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PsResponse {
    #[serde(default)]
    pub models: Vec<PsModel>,
}

/// One running model in a `/api/ps` response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PsModel {
    pub name: String,

    /// VRAM held by the model in bytes
    #[serde(default)]
    pub size_vram: u64,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<PsModel> for LoadedModel {
    fn from(model: PsModel) -> Self {
        LoadedModel { name: model.name, size_vram: model.size_vram, expires_at: model.expires_at }
    }
}

/// Parse a `/api/ps` body into loaded models
pub fn parse_ps(body: &str) -> Result<Vec<LoadedModel>, serde_json::Error> {
    let response: PsResponse = serde_json::from_str(body)?;
    Ok(response.models.into_iter().map(LoadedModel::from).collect())
}

/// HTTP client polling one Ollama server
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    provider: String,
}

impl OllamaClient {
    /// Create a client for `base_url`; `provider` names the server in errors
    pub fn new(base_url: impl Into<String>, provider: impl Into<String>) -> Result<Self, SdiError> {
        let provider = provider.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SdiError::misconfigured(format!("HTTP client for '{provider}': {e}")))?;

        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string(), provider })
    }

    /// Create a client from Ollama's environment configuration
    pub fn from_config(config: &OllamaConfig, provider: impl Into<String>) -> Result<Self, SdiError> {
        Self::new(config.base_url(), provider)
    }

    /// Get the Ollama base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the raw `/api/ps` response
    #[instrument(skip(self), fields(provider = %self.provider))]
    pub async fn running_models(&self) -> Result<PsResponse, SdiError> {
        let url = format!("{}/api/ps", self.base_url);
        debug!(url = %url, "Polling loaded models");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SdiError::poll(&self.provider, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SdiError::poll(&self.provider, format!("status {status}: {body}")));
        }

        response.json().await.map_err(|e| SdiError::poll(&self.provider, e.to_string()))
    }
}

#[async_trait]
impl LoadedModelSource for OllamaClient {
    async fn loaded_models(&self) -> Result<Vec<LoadedModel>, SdiError> {
        let response = self.running_models().await?;
        debug!(provider = %self.provider, count = response.models.len(), "Loaded models polled");
        Ok(response.models.into_iter().map(LoadedModel::from).collect())
    }
}
