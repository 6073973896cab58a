//! Logos request pipeline
//!
//! Turns an incoming request into a deployment holding capacity:
//! classification ranks candidates, the scheduler grants (or queues) one,
//! and context resolution produces the endpoint and credentials.
//!
//! ## Quick Start
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use logos_pipeline::{Classifier, ContextResolver, Gateway, PipelineRequest};
//! # async fn run(classifier: Arc<dyn Classifier>, resolver: Arc<dyn ContextResolver>) -> anyhow::Result<()> {
//! use logos_core::{DeploymentId, DeploymentMetadata};
//!
//! logos_pipeline::telemetry::init_logging()?;
//!
//! let gateway = Gateway::builder()
//!     .ollama_provider(1, "ollama", 24576)
//!     .deployment(DeploymentMetadata::local(DeploymentId::new(10, 1), "llama3.2:3b"))
//!     .classifier(classifier)
//!     .resolver(resolver)
//!     .build()
//!     .await?;
//!
//! let dispatch = gateway.pipeline().process(PipelineRequest::new(serde_json::json!({}))).await?;
//! // ... send the request to dispatch.routing.endpoint ...
//! gateway.pipeline().complete(&dispatch.request_id, dispatch.scheduling.deployment).await?;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod monitor;
pub mod pipeline;
pub mod telemetry;

pub use collaborators::{
    CallerContext, Classifier, ContextResolver, Dispatch, Monitor, PipelineRequest, Policy,
    RoutingContext,
};
pub use config::{ConfigError, GatewayConfig, SchedulerKind};
pub use error::PipelineError;
pub use gateway::{Gateway, GatewayBuilder};
pub use metrics::PrometheusMonitor;
pub use monitor::{CompositeMonitor, NoopMonitor, TracingMonitor};
pub use pipeline::Pipeline;
