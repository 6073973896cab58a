//! Request pipeline: classification, scheduling, context resolution.
//!
//! ```text
//! PipelineRequest
//!      │
//!      ▼
//! Classifier ──► [] ──► NoCandidates
//!      │
//!      ▼
//! Scheduler::schedule ──► Timeout / NoCapacity
//!      │  (capacity now held)
//!      ▼
//! ContextResolver ──► Resolution { scheduling, .. }   (capacity still held)
//!      │
//!      ▼
//!   Dispatch ──► caller sends the request ──► Pipeline::complete
//! ```

use std::sync::Arc;

use logos_core::{
    DeploymentId, RateLimitHeaders, RequestId, RequestMetrics, Scheduler, SchedulingRequest,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::collaborators::{Classifier, ContextResolver, Dispatch, Monitor, PipelineRequest};
use crate::error::PipelineError;

/// Drives one request from classification to a routable deployment
pub struct Pipeline {
    classifier: Arc<dyn Classifier>,
    scheduler: Arc<dyn Scheduler>,
    resolver: Arc<dyn ContextResolver>,
    monitor: Arc<dyn Monitor>,
}

impl Pipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        scheduler: Arc<dyn Scheduler>,
        resolver: Arc<dyn ContextResolver>,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self { classifier, scheduler, resolver, monitor }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Classify, schedule and resolve a request.
    ///
    /// On success the returned deployment holds capacity until
    /// [`Pipeline::complete`] is called. A [`PipelineError::Resolution`]
    /// also holds capacity; every other error holds none.
    #[instrument(skip_all, fields(request_id = tracing::field::Empty))]
    pub async fn process(&self, request: PipelineRequest) -> Result<Dispatch, PipelineError> {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| RequestId::new(Uuid::new_v4().to_string()));
        tracing::Span::current().record("request_id", tracing::field::display(&request_id));

        let outcome = self.run(&request_id, &request).await;
        if let Err(error) = &outcome {
            self.monitor.on_failed(&request_id, error).await;
        }
        outcome
    }

    async fn run(
        &self,
        request_id: &RequestId,
        request: &PipelineRequest,
    ) -> Result<Dispatch, PipelineError> {
        let candidates = self.classifier.classify(request).await.map_err(|source| {
            PipelineError::Classification { request_id: request_id.clone(), source }
        })?;
        if candidates.is_empty() {
            return Err(PipelineError::NoCandidates { request_id: request_id.clone() });
        }
        debug!(candidates = candidates.len(), "Classification complete");
        self.monitor.on_enqueued(request_id, &candidates).await;

        let mut scheduling_request =
            SchedulingRequest::new(request_id.clone(), candidates).with_payload(request.payload.clone());
        if let Some(timeout) = request.timeout {
            scheduling_request = scheduling_request.with_timeout(timeout);
        }

        let scheduling = self
            .scheduler
            .schedule(scheduling_request)
            .await
            .map_err(PipelineError::from_scheduling)?;
        self.monitor.on_scheduled(request_id, &scheduling).await;
        self.report_load().await;

        match self.resolver.resolve(request, &scheduling).await {
            Ok(routing) => Ok(Dispatch { request_id: request_id.clone(), scheduling, routing }),
            Err(source) => {
                Err(PipelineError::Resolution { request_id: request_id.clone(), scheduling, source })
            }
        }
    }

    /// Release the capacity held by `request_id` and record its completion
    #[instrument(skip_all, fields(request_id = %request_id, deployment = %deployment))]
    pub async fn complete(
        &self,
        request_id: &RequestId,
        deployment: DeploymentId,
    ) -> Result<RequestMetrics, PipelineError> {
        let metrics = self.scheduler.release(deployment, request_id).await?;
        self.monitor.on_completed(deployment, &metrics).await;
        self.report_load().await;
        Ok(metrics)
    }

    /// Feed a cloud response's rate-limit headers back into scheduling.
    ///
    /// Returns whether any rate-limit header was present.
    pub async fn report_rate_limits<I, K, V>(
        &self,
        deployment: DeploymentId,
        headers: I,
    ) -> Result<bool, PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let parsed = RateLimitHeaders::from_headers(headers);
        Ok(self.scheduler.update_rate_limits(deployment, parsed).await?)
    }

    async fn report_load(&self) {
        let stats = self.scheduler.core().stats().await;
        self.monitor.on_load(stats).await;
    }
}
