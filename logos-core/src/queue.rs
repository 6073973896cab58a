//! Per-deployment priority queues.
//!
//! Each deployment owns three FIFO tiers. Dequeue drains HIGH first, then
//! NORMAL, then LOW. Entries carry an opaque continuation (the scheduler stores
//! a single-slot wake-up channel there) and keep their original enqueue time
//! when promoted, so starvation checks measure the full wait.
//!
//! ```text
//! deployment 3@1
//!   HIGH   [e7]
//!   NORMAL [e2] [e5]      <- dequeue order: e7, e2, e5, e1, e4
//!   LOW    [e1] [e4]
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::QueueError;
use crate::types::{DeploymentId, Priority};

/// Identifier handed out by [`QueueManager::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entry-{}", self.0)
    }
}

/// Configuration for the queue manager
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of waiting requests per deployment
    pub max_depth_per_deployment: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_depth_per_deployment: 500 }
    }
}

impl QueueConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LOGOS_MAX_QUEUE_PER_DEPLOYMENT") {
            if let Ok(n) = val.parse() {
                config.max_depth_per_deployment = n;
            }
        }

        config
    }
}

/// Per-tier depth of one deployment's queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueState {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub total: usize,
}

impl QueueState {
    /// Depth of a single tier
    pub fn depth(&self, priority: Priority) -> usize {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
        }
    }
}

/// A waiting request
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub id: EntryId,
    pub deployment: DeploymentId,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub continuation: T,
}

impl<T> QueueEntry<T> {
    /// Time spent in the queue so far
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Read-only queue visibility, used by facades that report queue depth
#[async_trait]
pub trait QueueVisibility: Send + Sync {
    async fn queue_state(&self, deployment: DeploymentId) -> QueueState;
}

#[derive(Debug)]
struct Tiers<T> {
    tiers: [VecDeque<QueueEntry<T>>; 3],
}

impl<T> Default for Tiers<T> {
    fn default() -> Self {
        Self { tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()] }
    }
}

impl<T> Tiers<T> {
    fn tier(&self, priority: Priority) -> &VecDeque<QueueEntry<T>> {
        &self.tiers[priority.index()]
    }

    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry<T>> {
        &mut self.tiers[priority.index()]
    }

    fn total(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn state(&self) -> QueueState {
        QueueState {
            low: self.tier(Priority::Low).len(),
            normal: self.tier(Priority::Normal).len(),
            high: self.tier(Priority::High).len(),
            total: self.total(),
        }
    }

    fn take(&mut self, id: EntryId, priority: Priority) -> Option<QueueEntry<T>> {
        let tier = self.tier_mut(priority);
        let pos = tier.iter().position(|e| e.id == id)?;
        tier.remove(pos)
    }

    /// Insert keeping the tier ordered by original enqueue time
    fn insert_ordered(&mut self, entry: QueueEntry<T>) {
        let tier = self.tier_mut(entry.priority);
        let pos = tier
            .iter()
            .position(|e| (e.enqueued_at, e.id) > (entry.enqueued_at, entry.id))
            .unwrap_or(tier.len());
        tier.insert(pos, entry);
    }
}

struct Inner<T> {
    queues: HashMap<DeploymentId, Tiers<T>>,
    /// Where each live entry currently sits
    index: HashMap<EntryId, (DeploymentId, Priority)>,
    next_id: u64,
}

/// Priority queues for every deployment, guarded by a single lock
pub struct QueueManager<T> {
    config: QueueConfig,
    inner: Mutex<Inner<T>>,
}

impl<T: Send + 'static> QueueManager<T> {
    /// Create a new queue manager with the given configuration
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { queues: HashMap::new(), index: HashMap::new(), next_id: 0 }),
        }
    }

    /// Create a queue manager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(QueueConfig::default())
    }

    /// Append a waiter to the tail of its tier
    pub async fn enqueue(
        &self,
        continuation: T,
        deployment: DeploymentId,
        priority: Priority,
    ) -> Result<EntryId, QueueError> {
        let mut inner = self.inner.lock().await;

        let depth = inner.queues.get(&deployment).map(Tiers::total).unwrap_or(0);
        if depth >= self.config.max_depth_per_deployment {
            return Err(QueueError::QueueFull {
                deployment,
                max: self.config.max_depth_per_deployment,
            });
        }

        let id = EntryId(inner.next_id);
        inner.next_id += 1;

        let entry = QueueEntry { id, deployment, priority, enqueued_at: Instant::now(), continuation };
        inner.queues.entry(deployment).or_default().tier_mut(priority).push_back(entry);
        inner.index.insert(id, (deployment, priority));

        debug!(%deployment, %priority, entry = %id, depth = depth + 1, "Request enqueued");

        Ok(id)
    }

    /// Pop the next waiter for a deployment: HIGH, then NORMAL, then LOW
    pub async fn dequeue(&self, deployment: DeploymentId) -> Option<QueueEntry<T>> {
        let mut inner = self.inner.lock().await;
        let tiers = inner.queues.get_mut(&deployment)?;

        let entry = Priority::DEQUEUE_ORDER
            .iter()
            .find_map(|&priority| tiers.tier_mut(priority).pop_front())?;

        if tiers.total() == 0 {
            inner.queues.remove(&deployment);
        }
        inner.index.remove(&entry.id);

        debug!(
            %deployment,
            priority = %entry.priority,
            entry = %entry.id,
            wait_ms = entry.waited().as_millis() as u64,
            "Request dequeued"
        );

        Some(entry)
    }

    /// Per-tier counts for a deployment
    pub async fn get_state(&self, deployment: DeploymentId) -> QueueState {
        let inner = self.inner.lock().await;
        inner.queues.get(&deployment).map(Tiers::state).unwrap_or_default()
    }

    /// Total waiters for a deployment
    pub async fn get_total_depth(&self, deployment: DeploymentId) -> usize {
        let inner = self.inner.lock().await;
        inner.queues.get(&deployment).map(Tiers::total).unwrap_or(0)
    }

    /// Total waiters across all deployments
    pub async fn total_waiting(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Move an entry to a higher tier, keeping its enqueue timestamp.
    ///
    /// Returns `false` when the entry is gone or `new_priority` is not higher
    /// than its current tier; priorities never decrease.
    pub async fn move_priority(&self, id: EntryId, new_priority: Priority) -> bool {
        let mut inner = self.inner.lock().await;

        let Some(&(deployment, current)) = inner.index.get(&id) else {
            return false;
        };
        if new_priority <= current {
            return false;
        }

        let Some(tiers) = inner.queues.get_mut(&deployment) else {
            return false;
        };
        let Some(mut entry) = tiers.take(id, current) else {
            return false;
        };

        entry.priority = new_priority;
        tiers.insert_ordered(entry);
        inner.index.insert(id, (deployment, new_priority));

        debug!(%deployment, entry = %id, from = %current, to = %new_priority, "Entry promoted");

        true
    }

    /// Remove an entry wherever it is.
    ///
    /// Idempotent: returns `None` if the entry was already dequeued or removed.
    pub async fn remove(&self, id: EntryId) -> Option<QueueEntry<T>> {
        let mut inner = self.inner.lock().await;

        let (deployment, priority) = inner.index.remove(&id)?;
        let tiers = inner.queues.get_mut(&deployment)?;
        let entry = tiers.take(id, priority);

        if tiers.total() == 0 {
            inner.queues.remove(&deployment);
        }

        if entry.is_some() {
            debug!(%deployment, entry = %id, "Entry removed");
        }

        entry
    }

    /// Entries of one tier with their enqueue time, in queue order
    pub async fn waiting_since(
        &self,
        deployment: DeploymentId,
        priority: Priority,
    ) -> Vec<(EntryId, Instant)> {
        let inner = self.inner.lock().await;
        inner
            .queues
            .get(&deployment)
            .map(|tiers| tiers.tier(priority).iter().map(|e| (e.id, e.enqueued_at)).collect())
            .unwrap_or_default()
    }

    /// Priority tier an entry currently sits in
    pub async fn priority_of(&self, id: EntryId) -> Option<Priority> {
        self.inner.lock().await.index.get(&id).map(|&(_, priority)| priority)
    }
}

#[async_trait]
impl<T: Send + 'static> QueueVisibility for QueueManager<T> {
    async fn queue_state(&self, deployment: DeploymentId) -> QueueState {
        self.get_state(deployment).await
    }
}
