//! First-candidate-only policy: the top-weighted candidate or nothing.

use async_trait::async_trait;

use super::{Scheduler, SchedulerCore};
use crate::error::SchedulingError;
use crate::types::{SchedulingCandidate, SchedulingRequest, SchedulingResult};

/// Tries the highest-weighted candidate and queues on it when it is busy.
/// Lower-ranked candidates are never considered.
pub struct FirstCandidateScheduler {
    core: SchedulerCore,
}

impl FirstCandidateScheduler {
    pub fn new(core: SchedulerCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Scheduler for FirstCandidateScheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "first_candidate"
    }

    async fn try_schedule_immediately(
        &self,
        request: &SchedulingRequest,
    ) -> Result<Option<SchedulingResult>, SchedulingError> {
        let Some(top) = request.ranked().into_iter().next() else {
            return Ok(None);
        };

        let handle = self
            .core
            .registry()
            .provider_for(&top.deployment)
            .await
            .map_err(|e| SchedulingError::no_capacity(&request.request_id, e.to_string()))?;

        self.core.try_admit(&request.request_id, top, &handle).await
    }

    async fn queue_target(&self, request: &SchedulingRequest) -> Option<SchedulingCandidate> {
        request.ranked().into_iter().next().cloned()
    }
}
