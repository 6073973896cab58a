// Logos Core Library
//
// Capacity tracking, priority queuing and admission control for the Logos gateway

pub mod error;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sdi;
pub mod types;

pub use error::{QueueError, SchedulingError, SdiError};
pub use queue::{EntryId, QueueConfig, QueueEntry, QueueManager, QueueState, QueueVisibility};
pub use registry::ProviderRegistry;
pub use scheduler::{
    FirstCandidateScheduler, Scheduler, SchedulerConfig, SchedulerCore, SchedulerQueue,
    SchedulerStats, UtilizationScheduler,
};
pub use sdi::{
    CloudFacade, CloudProviderConfig, LoadedModel, LoadedModelSource, LocalFacade,
    LocalProviderConfig, ProviderHandle, RateLimitHeaders, SchedulingDataInterface,
};
pub use types::{
    Capacity, CloudCapacity, DeploymentId, DeploymentMetadata, LocalCapacity, ModelStatus,
    Priority, ProviderKind, ProviderMetrics, RequestId, RequestMetrics, SchedulingCandidate,
    SchedulingRequest, SchedulingResult,
};
