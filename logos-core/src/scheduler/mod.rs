//! Admission control and queuing
//!
//! A scheduler either grants a request a deployment right away or parks it
//! in the deployment's priority queue until a completing request hands its
//! slot over (or the wait times out).
//!
//! # Architecture
//!
//! ```text
//!   schedule(request)
//!         │
//!   ┌─────▼──────────────────┐   granted   ┌──────────────┐
//!   │ try_schedule_immediately├────────────►│  in-flight   │
//!   │   (policy specific)     │             └──────┬───────┘
//!   └─────┬──────────────────┘                    │ release()
//!         │ nothing reservable                    │
//!   ┌─────▼─────┐   hand-off (slot reused)  ┌─────▼───────┐
//!   │   queue   │◄──────────────────────────┤  starvation │
//!   │ H / N / L │                           │    check    │
//!   └───────────┘                           └─────────────┘
//! ```
//!
//! Policies implement only [`Scheduler::try_schedule_immediately`]; the wait,
//! release and hand-off protocol lives in [`SchedulerCore`].

mod first_candidate;
mod utilization;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SchedulingError, SdiError};
use crate::queue::{EntryId, QueueManager};
use crate::registry::ProviderRegistry;
use crate::sdi::{
    CloudFacade, LocalFacade, ProviderHandle, RateLimitHeaders, SchedulingDataInterface,
    DEFAULT_CAPACITY_THRESHOLD,
};
use crate::types::{
    DeploymentId, Priority, ProviderKind, ProviderMetrics, RequestId, RequestMetrics,
    SchedulingCandidate, SchedulingRequest, SchedulingResult,
};

pub use first_candidate::FirstCandidateScheduler;
pub use utilization::UtilizationScheduler;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue wait applied when a request carries no timeout of its own
    pub default_timeout: Duration,

    /// LOW waiters older than this move to NORMAL on the next release
    pub low_promotion_after: Duration,

    /// NORMAL waiters older than this move to HIGH on the next release
    pub normal_promotion_after: Duration,

    /// Remaining cloud requests at or below which a deployment has no capacity
    pub cloud_capacity_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            low_promotion_after: Duration::from_secs(10),
            normal_promotion_after: Duration::from_secs(30),
            cloud_capacity_threshold: DEFAULT_CAPACITY_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_u64("LOGOS_QUEUE_TIMEOUT_SECS") {
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LOGOS_LOW_PROMOTION_SECS") {
            config.low_promotion_after = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("LOGOS_NORMAL_PROMOTION_SECS") {
            config.normal_promotion_after = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_u64("LOGOS_CLOUD_THRESHOLD") {
            config.cloud_capacity_threshold = threshold;
        }

        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|val| val.trim().parse().ok())
}

/// Queue continuation: the single-slot channel a parked request waits on
#[derive(Debug)]
pub struct Waiter {
    request_id: RequestId,
    tx: oneshot::Sender<SchedulingResult>,
}

/// Queue manager specialised for scheduler waiters
pub type SchedulerQueue = QueueManager<Waiter>;

enum WaitState {
    Parked(oneshot::Receiver<SchedulingResult>),
    Granted,
    Done,
}

/// Cleanup for a `wait_for_capacity` future dropped before it finished.
///
/// A parked wait pulls its queue entry, or returns the slot if a hand-off
/// already claimed the entry. A granted wait returns its slot.
struct ParkedWait {
    queue: Arc<SchedulerQueue>,
    handle: ProviderHandle,
    request_id: RequestId,
    entry: EntryId,
    model_id: u64,
    state: WaitState,
}

impl ParkedWait {
    fn receiver(&mut self) -> Option<&mut oneshot::Receiver<SchedulingResult>> {
        match &mut self.state {
            WaitState::Parked(rx) => Some(rx),
            _ => None,
        }
    }
}

impl Drop for ParkedWait {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut self.state, WaitState::Done);
        if matches!(state, WaitState::Done) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(request_id = %self.request_id, entry = %self.entry, "No runtime to clean up abandoned wait");
            return;
        };

        let queue = self.queue.clone();
        let handle = self.handle.clone();
        let request_id = self.request_id.clone();
        let entry = self.entry;
        let model_id = self.model_id;

        runtime.spawn(async move {
            let holds_slot = match state {
                WaitState::Parked(rx) => match queue.remove(entry).await {
                    Some(_) => false,
                    None => rx.await.is_ok(),
                },
                WaitState::Granted => true,
                WaitState::Done => false,
            };

            if holds_slot {
                return_slot(&handle, model_id).await;
            }
            let _ = handle.sdi().on_request_cancelled(&request_id).await;
            debug!(%request_id, entry = %entry, returned_slot = holds_slot, "Abandoned wait cleaned up");
        });
    }
}

async fn return_slot(handle: &ProviderHandle, model_id: u64) {
    if let ProviderHandle::Local(local) = handle {
        if let Err(e) = local.release_capacity(model_id).await {
            warn!(model_id, error = %e, "Failed to return slot");
        }
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    deployment: DeploymentId,
    granted_at: Instant,
    is_cold_start: bool,
}

/// Statistics about the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub num_waiting: usize,
    pub num_in_flight: usize,
}

impl std::fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scheduler: {} waiting, {} in flight", self.num_waiting, self.num_in_flight)
    }
}

/// State and protocol shared by every scheduling policy
pub struct SchedulerCore {
    config: SchedulerConfig,
    queue: Arc<SchedulerQueue>,
    registry: Arc<ProviderRegistry>,
    in_flight: Mutex<HashMap<RequestId, InFlight>>,
}

impl SchedulerCore {
    pub fn new(config: SchedulerConfig, queue: Arc<SchedulerQueue>, registry: Arc<ProviderRegistry>) -> Self {
        Self { config, queue, registry, in_flight: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<SchedulerQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Get statistics about the scheduler
    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            num_waiting: self.queue.total_waiting().await,
            num_in_flight: self.in_flight.lock().await.len(),
        }
    }

    /// Whether `request_id` currently holds a grant
    pub async fn is_in_flight(&self, request_id: &RequestId) -> bool {
        self.in_flight.lock().await.contains_key(request_id)
    }

    async fn track(&self, request_id: &RequestId, deployment: DeploymentId, is_cold_start: bool) {
        self.in_flight.lock().await.insert(
            request_id.clone(),
            InFlight { deployment, granted_at: Instant::now(), is_cold_start },
        );
    }

    /// Try to grant `candidate` right away.
    ///
    /// Local deployments need a successful reservation; cloud deployments
    /// only need a budget above the threshold. `Ok(None)` means "not now".
    pub async fn try_admit(
        &self,
        request_id: &RequestId,
        candidate: &SchedulingCandidate,
        handle: &ProviderHandle,
    ) -> Result<Option<SchedulingResult>, SchedulingError> {
        match handle {
            ProviderHandle::Local(local) => self.try_admit_local(request_id, candidate, local).await,
            ProviderHandle::Cloud(cloud) => self.try_admit_cloud(request_id, candidate, cloud).await,
        }
    }

    async fn try_admit_local(
        &self,
        request_id: &RequestId,
        candidate: &SchedulingCandidate,
        local: &LocalFacade,
    ) -> Result<Option<SchedulingResult>, SchedulingError> {
        let deployment = candidate.deployment;
        let model_id = deployment.model_id;

        if let Some(limit) = candidate.parallel_capacity {
            local.update_model_capacity(model_id, limit).await?;
        }

        let status = local.get_model_status(model_id).await?;
        let capacity = local.get_capacity_info(model_id).await?;
        let utilization = local.utilization(model_id).await?;

        if !local.try_reserve_capacity(model_id).await? {
            debug!(%request_id, %deployment, "No free slot");
            return Ok(None);
        }

        let result = SchedulingResult {
            deployment,
            provider_kind: ProviderKind::Local,
            was_queued: false,
            queue_depth_at_schedule: status.queue_depth(),
            utilization_at_arrival: Some(utilization),
            provider_metrics: capacity.provider_metrics(),
            priority: candidate.priority,
            is_cold_start: !status.is_loaded,
        };

        if let Err(e) = self.begin(local, request_id, model_id, candidate.priority).await {
            if let Err(release_err) = local.release_capacity(model_id).await {
                warn!(%request_id, %deployment, error = %release_err, "Failed to return reserved slot");
            }
            return Err(e.into());
        }

        self.track(request_id, deployment, result.is_cold_start).await;
        Ok(Some(result))
    }

    async fn try_admit_cloud(
        &self,
        request_id: &RequestId,
        candidate: &SchedulingCandidate,
        cloud: &CloudFacade,
    ) -> Result<Option<SchedulingResult>, SchedulingError> {
        let deployment = candidate.deployment;
        let capacity = cloud.get_capacity_info(deployment.model_id).await?;
        if !capacity.has_capacity() {
            debug!(%request_id, %deployment, "Cloud budget exhausted");
            return Ok(None);
        }

        self.begin(cloud, request_id, deployment.model_id, candidate.priority).await?;
        self.track(request_id, deployment, false).await;

        Ok(Some(SchedulingResult {
            deployment,
            provider_kind: ProviderKind::Cloud,
            was_queued: false,
            queue_depth_at_schedule: 0,
            utilization_at_arrival: None,
            provider_metrics: capacity.provider_metrics(),
            priority: candidate.priority,
            is_cold_start: false,
        }))
    }

    /// Start and immediately begin processing, without counting a slot
    async fn begin(
        &self,
        sdi: &dyn SchedulingDataInterface,
        request_id: &RequestId,
        model_id: u64,
        priority: Priority,
    ) -> Result<(), SdiError> {
        sdi.on_request_start(request_id, model_id, priority).await?;
        if let Err(e) = sdi.on_request_begin_processing(request_id, false).await {
            let _ = sdi.on_request_cancelled(request_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Park the request on `target` until a slot is handed over or the wait times out
    pub async fn wait_for_capacity(
        &self,
        request: &SchedulingRequest,
        target: &SchedulingCandidate,
    ) -> Result<SchedulingResult, SchedulingError> {
        let request_id = &request.request_id;
        let deployment = target.deployment;
        let model_id = deployment.model_id;

        let handle = self.registry.provider_for(&deployment).await?;
        let sdi = handle.sdi();

        let arrival_depth = self.queue.get_total_depth(deployment).await;
        let arrival_utilization = match &handle {
            ProviderHandle::Local(local) => local.utilization(model_id).await.ok(),
            ProviderHandle::Cloud(_) => None,
        };

        sdi.on_request_start(request_id, model_id, target.priority).await?;

        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { request_id: request_id.clone(), tx };
        let entry = match self.queue.enqueue(waiter, deployment, target.priority).await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = sdi.on_request_cancelled(request_id).await;
                return Err(SchedulingError::no_capacity(request_id, e.to_string()));
            }
        };

        info!(%request_id, %deployment, priority = %target.priority, entry = %entry, depth = arrival_depth + 1, "Request queued");

        let mut parked = ParkedWait {
            queue: self.queue.clone(),
            handle: handle.clone(),
            request_id: request_id.clone(),
            entry,
            model_id,
            state: WaitState::Parked(rx),
        };

        self.claim_freed_capacity(&handle, deployment).await;

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();

        let granted = match parked.receiver() {
            Some(rx) => match tokio::time::timeout(timeout, &mut *rx).await {
                Ok(received) => received.ok(),
                Err(_) => self.resolve_timeout(entry, rx).await,
            },
            None => None,
        };

        let Some(mut result) = granted else {
            let _ = sdi.on_request_cancelled(request_id).await;
            parked.state = WaitState::Done;
            warn!(%request_id, %deployment, waited_ms = started.elapsed().as_millis() as u64, "Queue wait timed out");
            return Err(SchedulingError::QueueTimeout {
                request_id: request_id.clone(),
                waited: started.elapsed(),
            });
        };
        parked.state = WaitState::Granted;

        result.queue_depth_at_schedule = arrival_depth;
        result.utilization_at_arrival = arrival_utilization;

        if let Err(e) = sdi.on_request_begin_processing(request_id, false).await {
            parked.state = WaitState::Done;
            let _ = sdi.on_request_cancelled(request_id).await;
            return_slot(&handle, model_id).await;
            return Err(e.into());
        }

        self.track(request_id, deployment, result.is_cold_start).await;
        parked.state = WaitState::Done;
        info!(%request_id, %deployment, waited_ms = started.elapsed().as_millis() as u64, "Queued request resumed");

        Ok(result)
    }

    /// The timer fired: either we pull the entry ourselves, or a releaser got
    /// there first and its hand-off is already on the way.
    async fn resolve_timeout(
        &self,
        entry: EntryId,
        rx: &mut oneshot::Receiver<SchedulingResult>,
    ) -> Option<SchedulingResult> {
        if self.queue.remove(entry).await.is_some() {
            return None;
        }
        debug!(entry = %entry, "Timeout lost the race to a hand-off");
        rx.await.ok()
    }

    /// A slot freed between the failed admission and the enqueue has no
    /// releaser left to hand it over, so pass it to the queue head here.
    async fn claim_freed_capacity(&self, handle: &ProviderHandle, deployment: DeploymentId) {
        match handle {
            ProviderHandle::Local(local) => {
                if local.try_reserve_capacity(deployment.model_id).await.unwrap_or(false) {
                    debug!(%deployment, "Slot freed while queuing");
                    self.hand_off(handle, deployment).await;
                }
            }
            ProviderHandle::Cloud(cloud) => {
                self.wake_cloud_waiters(handle, cloud, deployment).await;
            }
        }
    }

    /// Complete a granted request and pass its slot on
    pub async fn release(
        &self,
        deployment: DeploymentId,
        request_id: &RequestId,
    ) -> Result<RequestMetrics, SchedulingError> {
        let handle = self.registry.provider_for(&deployment).await?;

        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(request_id) {
                Some(flight) if flight.deployment == deployment => in_flight.remove(request_id),
                _ => None,
            }
        }
        .ok_or_else(|| SchedulingError::UnknownRequest(request_id.clone()))?;

        let duration = flight.granted_at.elapsed();
        self.promote_starving(deployment).await;

        match &handle {
            ProviderHandle::Local(local) => {
                let waiter_exists = self.queue.get_total_depth(deployment).await > 0;
                // A lowered limit drains on release instead of passing the slot on
                let over_limit = local.is_over_limit(deployment.model_id).await.unwrap_or(false);
                let reuse = waiter_exists && !over_limit;
                let metrics = local
                    .on_request_complete(request_id, flight.is_cold_start, duration, reuse)
                    .await?;

                if reuse {
                    self.hand_off(&handle, deployment).await;
                } else if self.queue.get_total_depth(deployment).await > 0
                    && local.try_reserve_capacity(deployment.model_id).await.unwrap_or(false)
                {
                    // A waiter arrived between the depth check and completion
                    self.hand_off(&handle, deployment).await;
                }

                debug!(%request_id, %deployment, processing_ms = duration.as_millis() as u64, "Request released");
                Ok(metrics)
            }
            ProviderHandle::Cloud(cloud) => {
                let metrics = cloud
                    .on_request_complete(request_id, flight.is_cold_start, duration, false)
                    .await?;
                self.wake_cloud_waiters(&handle, cloud, deployment).await;

                debug!(%request_id, %deployment, processing_ms = duration.as_millis() as u64, "Request released");
                Ok(metrics)
            }
        }
    }

    /// Promote waiters past their tier's age limit, at most one tier per entry
    pub async fn promote_starving(&self, deployment: DeploymentId) -> usize {
        let normal = self.queue.waiting_since(deployment, Priority::Normal).await;
        let low = self.queue.waiting_since(deployment, Priority::Low).await;
        let now = Instant::now();
        let mut promoted = 0;

        let tiers = [
            (normal, self.config.normal_promotion_after, Priority::High),
            (low, self.config.low_promotion_after, Priority::Normal),
        ];

        for (entries, after, to) in tiers {
            // Tiers are ordered by enqueue time, oldest first
            for (entry, since) in entries.into_iter().take_while(|(_, since)| now - *since >= after) {
                if self.queue.move_priority(entry, to).await {
                    info!(%deployment, entry = %entry, to = %to, waited_ms = (now - since).as_millis() as u64, "Promoted starving request");
                    promoted += 1;
                }
            }
        }

        promoted
    }

    /// Give the slot already held for `deployment` to the next live waiter,
    /// or back to the facade if there is none.
    async fn hand_off(&self, handle: &ProviderHandle, deployment: DeploymentId) {
        loop {
            let Some(entry) = self.queue.dequeue(deployment).await else {
                debug!(%deployment, "No waiter left for hand-off");
                return_slot(handle, deployment.model_id).await;
                return;
            };

            let result = self.queued_result(handle, deployment, entry.priority).await;
            let Waiter { request_id, tx } = entry.continuation;

            match tx.send(result) {
                Ok(()) => {
                    debug!(%deployment, %request_id, "Slot handed off");
                    return;
                }
                Err(_) => {
                    debug!(%deployment, %request_id, "Waiter gone, trying next");
                    let _ = handle.sdi().on_request_cancelled(&request_id).await;
                }
            }
        }
    }

    /// Resume cloud waiters while the deployment reports capacity
    async fn wake_cloud_waiters(&self, handle: &ProviderHandle, cloud: &CloudFacade, deployment: DeploymentId) -> usize {
        let mut woken = 0;
        loop {
            if self.queue.get_total_depth(deployment).await == 0 {
                break;
            }
            match cloud.get_capacity_info(deployment.model_id).await {
                Ok(capacity) if capacity.has_capacity() => {}
                _ => break,
            }
            let Some(entry) = self.queue.dequeue(deployment).await else {
                break;
            };

            let result = self.queued_result(handle, deployment, entry.priority).await;
            let Waiter { request_id, tx } = entry.continuation;
            if tx.send(result).is_ok() {
                woken += 1;
            } else {
                let _ = cloud.on_request_cancelled(&request_id).await;
            }
        }

        if woken > 0 {
            info!(%deployment, woken, "Cloud waiters resumed");
        }
        woken
    }

    /// Result handed to a waiter; the waiter fills in its arrival snapshot
    async fn queued_result(
        &self,
        handle: &ProviderHandle,
        deployment: DeploymentId,
        priority: Priority,
    ) -> SchedulingResult {
        let sdi = handle.sdi();
        let model_id = deployment.model_id;

        let is_cold_start = match handle {
            ProviderHandle::Local(_) => match sdi.get_model_status(model_id).await {
                Ok(status) => !status.is_loaded,
                Err(e) => {
                    warn!(%deployment, error = %e, "Status unavailable for hand-off");
                    false
                }
            },
            ProviderHandle::Cloud(_) => false,
        };

        let provider_metrics = match sdi.get_capacity_info(model_id).await {
            Ok(capacity) => capacity.provider_metrics(),
            Err(e) => {
                warn!(%deployment, error = %e, "Capacity unavailable for hand-off");
                match handle.kind() {
                    ProviderKind::Local => ProviderMetrics::Local { available_vram_mb: 0 },
                    ProviderKind::Cloud => ProviderMetrics::Cloud {
                        rate_limit_remaining_requests: None,
                        rate_limit_remaining_tokens: None,
                    },
                }
            }
        };

        SchedulingResult {
            deployment,
            provider_kind: handle.kind(),
            was_queued: true,
            queue_depth_at_schedule: 0,
            utilization_at_arrival: None,
            provider_metrics,
            priority,
            is_cold_start,
        }
    }

    /// Record rate limits for a cloud deployment and resume its waiters if the budget recovered
    pub async fn update_rate_limits(
        &self,
        deployment: DeploymentId,
        headers: RateLimitHeaders,
    ) -> Result<bool, SchedulingError> {
        let handle = self.registry.provider_for(&deployment).await?;
        let Some(cloud) = handle.as_cloud() else {
            return Err(SdiError::misconfigured(format!(
                "deployment {deployment} is not a cloud deployment"
            ))
            .into());
        };

        let external_id = cloud.external_id(deployment.model_id).await?;
        if !cloud.record_rate_limits(&external_id, headers).await {
            return Ok(false);
        }

        self.wake_cloud_waiters(&handle, cloud, deployment).await;
        Ok(true)
    }

    /// Highest-ranked registered candidate
    pub async fn first_registered<'a>(
        &self,
        request: &'a SchedulingRequest,
    ) -> Option<&'a SchedulingCandidate> {
        for candidate in request.ranked() {
            if self.registry.is_registered(&candidate.deployment).await {
                return Some(candidate);
            }
        }
        None
    }
}

/// A scheduling policy over the shared [`SchedulerCore`]
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn core(&self) -> &SchedulerCore;

    /// Policy name, used in logs and metrics
    fn name(&self) -> &'static str;

    /// Grant a deployment without waiting, if the policy finds one
    async fn try_schedule_immediately(
        &self,
        request: &SchedulingRequest,
    ) -> Result<Option<SchedulingResult>, SchedulingError>;

    /// Candidate to wait on when nothing is immediately available
    async fn queue_target(&self, request: &SchedulingRequest) -> Option<SchedulingCandidate> {
        self.core().first_registered(request).await.cloned()
    }

    /// Grant a deployment now or after queuing
    async fn schedule(&self, request: SchedulingRequest) -> Result<SchedulingResult, SchedulingError> {
        if request.candidates.is_empty() {
            return Err(SchedulingError::no_capacity(&request.request_id, "no candidates"));
        }

        if let Some(result) = self.try_schedule_immediately(&request).await? {
            info!(
                scheduler = self.name(),
                request_id = %request.request_id,
                deployment = %result.deployment,
                cold_start = result.is_cold_start,
                "Request scheduled"
            );
            return Ok(result);
        }

        let Some(target) = self.queue_target(&request).await else {
            return Err(SchedulingError::no_capacity(&request.request_id, "no registered candidates"));
        };

        self.core().wait_for_capacity(&request, &target).await
    }

    /// Complete a granted request; its slot goes to the next waiter
    async fn release(
        &self,
        deployment: DeploymentId,
        request_id: &RequestId,
    ) -> Result<RequestMetrics, SchedulingError> {
        self.core().release(deployment, request_id).await
    }

    /// Feed cloud rate-limit headers back into scheduling
    async fn update_rate_limits(
        &self,
        deployment: DeploymentId,
        headers: RateLimitHeaders,
    ) -> Result<bool, SchedulingError> {
        self.core().update_rate_limits(deployment, headers).await
    }
}
