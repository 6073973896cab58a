//! Error types for the Logos scheduling core
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! SchedulingError (returned by schedulers)
//! ├── NoCapacity       - nothing reservable and queuing failed or was not attempted
//! ├── QueueTimeout     - the wait exceeded the request's timeout
//! ├── UnknownRequest   - release of a request that is not in flight
//! └── Sdi(SdiError)    - facade failures
//!     ├── UnregisteredDeployment
//!     ├── UnknownRequest / DuplicateRequest
//!     ├── CapacityExhausted
//!     ├── ProviderPoll     - absorbed by the local facade, surfaced by pollers
//!     └── Misconfiguration - raised at registration time
//! QueueError
//! └── QueueFull
//! ```
//!
//! Application code should use `anyhow` with context:
//!
//! ```rust,ignore
//! use anyhow::Context;
//!
//! registry.register_deployment(metadata)
//!     .await
//!     .context("Failed to register deployment")?;
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::types::{DeploymentId, RequestId};

/// Errors raised by the scheduling data interface facades
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdiError {
    /// A facade method was called for a model that was never registered
    #[error("Model {model_id} is not registered with provider '{provider}'")]
    UnregisteredDeployment { model_id: u64, provider: String },

    /// A lifecycle method was called with a request id that is not tracked
    #[error("Request {0} is not tracked")]
    UnknownRequest(RequestId),

    /// A lifecycle record already exists for this request id
    #[error("Request {0} is already tracked")]
    DuplicateRequest(RequestId),

    /// Incrementing the active counter would exceed the parallel capacity
    #[error("Model {model_id} is at its parallel capacity of {limit}")]
    CapacityExhausted { model_id: u64, limit: usize },

    /// Polling the local provider failed
    #[error("Polling provider '{provider}' failed: {message}")]
    ProviderPoll { provider: String, message: String },

    /// Required registration fields are missing or invalid
    #[error("Misconfiguration: {0}")]
    Misconfiguration(String),
}

impl SdiError {
    /// Create an unregistered deployment error
    pub fn unregistered(model_id: u64, provider: impl Into<String>) -> Self {
        Self::UnregisteredDeployment { model_id, provider: provider.into() }
    }

    /// Create a provider poll failure
    pub fn poll(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderPoll { provider: provider.into(), message: message.into() }
    }

    /// Create a misconfiguration error
    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self::Misconfiguration(message.into())
    }
}

/// Errors raised by the queue manager
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Queue for {deployment} is full (max: {max})")]
    QueueFull { deployment: DeploymentId, max: usize },
}

/// Errors returned by schedulers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    /// No candidate could be reserved and queuing failed or was not attempted
    #[error("No capacity for request {request_id}: {reason}")]
    NoCapacity { request_id: RequestId, reason: String },

    /// The queue wait exceeded the request's timeout
    #[error("Request {request_id} timed out after {waited:?} in queue")]
    QueueTimeout { request_id: RequestId, waited: Duration },

    /// Release was called for a request that is not in flight
    #[error("Request {0} is not in flight")]
    UnknownRequest(RequestId),

    #[error(transparent)]
    Sdi(#[from] SdiError),
}

impl SchedulingError {
    /// Create a no-capacity error
    pub fn no_capacity(request_id: &RequestId, reason: impl Into<String>) -> Self {
        Self::NoCapacity { request_id: request_id.clone(), reason: reason.into() }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. } | Self::NoCapacity { .. })
    }
}
