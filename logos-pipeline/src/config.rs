//! Configuration for the Logos gateway.

use std::str::FromStr;
use std::time::Duration;

use logos_adapters_ollama::OllamaConfig;
use logos_core::{QueueConfig, SchedulerConfig};

/// Scheduling policy selected by `LOGOS_SCHEDULER`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Score candidates by warmth, queue depth and cloud budget
    #[default]
    Utilization,
    /// Top-weighted candidate only
    FirstCandidate,
}

impl FromStr for SchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "utilization" | "utilization_aware" => Ok(Self::Utilization),
            "first" | "first_candidate" => Ok(Self::FirstCandidate),
            other => Err(ConfigError::UnknownScheduler(other.to_string())),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Utilization => write!(f, "utilization"),
            SchedulerKind::FirstCandidate => write!(f, "first"),
        }
    }
}

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Scheduling policy name (`utilization` or `first`).
    pub scheduler_name: String,

    /// Queue timeout, promotion ages and cloud threshold.
    pub scheduler: SchedulerConfig,

    /// Per-deployment queue bound.
    pub queue: QueueConfig,

    /// Minimum interval between loaded-model polls of a local provider.
    pub poll_interval: Duration,

    /// Ollama environment; `num_parallel` seeds local parallel capacity.
    pub ollama: OllamaConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            scheduler_name: SchedulerKind::default().to_string(),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            poll_interval: Duration::from_secs(5),
            ollama: OllamaConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LOGOS_SCHEDULER`: `utilization` or `first` (default: utilization)
    /// - `LOGOS_QUEUE_TIMEOUT_SECS`: queue wait before timing out (default: 300)
    /// - `LOGOS_LOW_PROMOTION_SECS`: LOW -> NORMAL promotion age (default: 10)
    /// - `LOGOS_NORMAL_PROMOTION_SECS`: NORMAL -> HIGH promotion age (default: 30)
    /// - `LOGOS_CLOUD_THRESHOLD`: remaining cloud requests treated as exhausted (default: 10)
    /// - `LOGOS_MAX_QUEUE_PER_DEPLOYMENT`: queue bound per deployment (default: 500)
    /// - `LOGOS_POLL_INTERVAL_SECS`: loaded-model poll interval (default: 5)
    /// - `OLLAMA_*`: see [`OllamaConfig::from_env`]
    pub fn from_env() -> Self {
        Self {
            scheduler_name: std::env::var("LOGOS_SCHEDULER")
                .unwrap_or_else(|_| SchedulerKind::default().to_string()),
            scheduler: SchedulerConfig::from_env(),
            queue: QueueConfig::from_env(),
            poll_interval: std::env::var("LOGOS_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5)),
            ollama: OllamaConfig::from_env(),
        }
    }

    /// Parsed scheduling policy
    pub fn scheduler_kind(&self) -> Result<SchedulerKind, ConfigError> {
        self.scheduler_name.parse()
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler_kind()?;

        let durations = [
            ("queue timeout", self.scheduler.default_timeout),
            ("low promotion age", self.scheduler.low_promotion_after),
            ("normal promotion age", self.scheduler.normal_promotion_after),
            ("poll interval", self.poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        if self.queue.max_depth_per_deployment == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Unknown scheduler '{0}' (expected 'utilization' or 'first')")]
    UnknownScheduler(String),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("Queue depth per deployment must be at least 1")]
    ZeroQueueDepth,
}
