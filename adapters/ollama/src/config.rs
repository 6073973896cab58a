use serde::{Deserialize, Serialize};
use std::env;

/// Default Ollama listen address
pub const DEFAULT_OLLAMA_HOST: &str = "127.0.0.1:11434";

/// Ollama configuration from environment variables
///
/// Only the settings that shape scheduling are kept: how many requests a
/// loaded model serves in parallel and where the server listens.
///
/// Reference: https://github.com/ollama/ollama/blob/main/docs/faq.md#how-do-i-configure-ollama-server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct OllamaConfig {
    /// Number of parallel requests each loaded model handles
    /// Default: 4 when unset on recent Ollama releases
    pub num_parallel: Option<u32>,

    /// Ollama host address
    /// Default: "127.0.0.1:11434"
    pub ollama_host: Option<String>,
}

impl OllamaConfig {
    /// Read current Ollama configuration from environment variables
    ///
    /// # Example
    /// ```
    /// use logos_adapters_ollama::OllamaConfig;
    ///
    /// let config = OllamaConfig::from_env();
    /// println!("Polling {}", config.base_url());
    /// ```
    pub fn from_env() -> Self {
        Self {
            num_parallel: env::var("OLLAMA_NUM_PARALLEL").ok().and_then(|s| s.parse().ok()),
            ollama_host: env::var("OLLAMA_HOST").ok(),
        }
    }

    /// HTTP base URL of the Ollama API, without a trailing slash
    pub fn base_url(&self) -> String {
        let host = self.ollama_host.as_deref().unwrap_or(DEFAULT_OLLAMA_HOST).trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        }
    }

    /// Parallel capacity to seed the provider-level limit with
    pub fn parallel_capacity(&self) -> Option<usize> {
        self.num_parallel.filter(|&n| n > 0).map(|n| n as usize)
    }
}
