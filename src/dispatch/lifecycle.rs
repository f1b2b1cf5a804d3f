//! Lifecycle tracker: applies worker signals, cancellations and SLA
//! timeouts to work items.
//!
//! All item mutation happens under the queue write lock. When a worker must
//! be released in the same step, the registry lock is taken second.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::item::WorkItem;
use super::queue::{QueueState, WorkQueue};
use crate::config::DispatchConfig;
use crate::error::{Error, ItemError, WorkerError};
use crate::workers::WorkerRegistry;
use crate::workers::registry::RegistryState;

/// What a worker is reporting about an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalKind {
    /// Generation started, optionally with partial output.
    Progress {
        #[serde(default)]
        partial: Option<String>,
    },
    /// Final output.
    Complete { content: String },
    /// Generation failed.
    Error { detail: String },
}

impl SignalKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// A signal from a worker about one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSignal {
    pub item_id: Uuid,
    pub worker_id: String,
    #[serde(flatten)]
    pub kind: SignalKind,
}

/// Result of expiring one overdue item.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// Returned to pending for another attempt.
    Requeued {
        item_id: Uuid,
        worker_id: Option<String>,
        attempts: u32,
    },
    /// Retries exhausted.
    Aborted {
        item_id: Uuid,
        worker_id: Option<String>,
        attempts: u32,
    },
}

impl TimeoutOutcome {
    pub fn item_id(&self) -> Uuid {
        match self {
            Self::Requeued { item_id, .. } | Self::Aborted { item_id, .. } => *item_id,
        }
    }
}

pub struct LifecycleTracker {
    queue: Arc<WorkQueue>,
    registry: Arc<WorkerRegistry>,
    sla: chrono::Duration,
    max_attempts: u32,
}

impl LifecycleTracker {
    pub fn new(
        queue: Arc<WorkQueue>,
        registry: Arc<WorkerRegistry>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            sla: chrono::Duration::from_std(config.sla)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn apply_signal(&self, signal: WorkerSignal) -> Result<WorkItem, Error> {
        self.apply_signal_at(signal, Utc::now()).await
    }

    /// Apply a worker signal. Overdue items are expired first, so a worker
    /// reporting after its SLA is rejected like any other stale holder.
    pub async fn apply_signal_at(
        &self,
        signal: WorkerSignal,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, Error> {
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;

        self.expire_overdue(&mut queue, &mut registry, now).await;

        let item = queue.get_mut(signal.item_id)?;
        let worker_id = signal.worker_id.as_str();
        let result = match signal.kind {
            SignalKind::Progress { partial } => item.progress(worker_id, partial, now).map(|changed| {
                if !changed {
                    debug!(item_id = %item.id, worker_id, "Duplicate progress signal");
                }
                None
            }),
            SignalKind::Complete { content } => item.complete(worker_id, content, now).map(Some),
            SignalKind::Error { detail } => item.fail(worker_id, detail, now).map(Some),
        };

        let released = match result {
            Ok(released) => released,
            Err(e) => {
                warn!(
                    item_id = %signal.item_id,
                    worker_id,
                    error = %e,
                    "Rejected worker signal"
                );
                return Err(e.into());
            }
        };

        let item = item.clone();
        queue.track(item.id);
        if let Some(ref worker) = released {
            release(&mut registry, worker, item.id);
            queue.record_handled(worker, item.id);
            info!(
                item_id = %item.id,
                worker_id = %worker,
                state = %item.state,
                "Item finished"
            );
        }
        drop(registry);
        self.queue.commit(&item).await;
        Ok(item)
    }

    pub async fn cancel(&self, item_id: Uuid) -> Result<WorkItem, Error> {
        self.cancel_at(item_id, Utc::now()).await
    }

    /// Finalize an item as aborted from any non-terminal state.
    pub async fn cancel_at(&self, item_id: Uuid, now: DateTime<Utc>) -> Result<WorkItem, Error> {
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;

        let item = queue.get_mut(item_id)?;
        let released = item.abort("cancelled", now)?;
        let item = item.clone();
        queue.track(item_id);
        if let Some(ref worker) = released {
            release(&mut registry, worker, item_id);
        }
        drop(registry);
        self.queue.commit(&item).await;

        info!(item_id = %item_id, released = ?released, "Item cancelled");
        Ok(item)
    }

    pub async fn sweep_timeouts(&self) -> Vec<TimeoutOutcome> {
        self.sweep_timeouts_at(Utc::now()).await
    }

    /// Expire every item held past the SLA.
    pub async fn sweep_timeouts_at(&self, now: DateTime<Utc>) -> Vec<TimeoutOutcome> {
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;
        self.expire_overdue(&mut queue, &mut registry, now).await
    }

    /// Requeue or abort overdue items. Callers hold both write guards.
    pub(crate) async fn expire_overdue(
        &self,
        queue: &mut QueueState,
        registry: &mut RegistryState,
        now: DateTime<Utc>,
    ) -> Vec<TimeoutOutcome> {
        let mut outcomes = Vec::new();

        for item_id in queue.held_ids() {
            let Ok(item) = queue.get(item_id) else {
                continue;
            };
            if !item.is_overdue(self.sla, now) {
                continue;
            }
            match self.release_held(queue, registry, item_id, "sla timeout", now).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(item_id = %item_id, error = %e, "Failed to expire item"),
            }
        }

        if !outcomes.is_empty() {
            debug!(count = outcomes.len(), "Expired overdue items");
        }
        outcomes
    }

    /// Take a held item away from its worker and apply the retry policy.
    async fn release_held(
        &self,
        queue: &mut QueueState,
        registry: &mut RegistryState,
        item_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TimeoutOutcome, ItemError> {
        let max_attempts = self.max_attempts;
        let item = queue.get_mut(item_id)?;
        let attempts = item.attempts;

        let (worker_id, requeued) = if attempts < max_attempts {
            (item.requeue(reason, now)?, true)
        } else {
            (item.abort(reason, now)?, false)
        };
        let item = item.clone();
        queue.track(item_id);

        if let Some(ref worker) = worker_id {
            release(registry, worker, item_id);
        }
        self.queue.commit(&item).await;

        let outcome = if requeued {
            info!(item_id = %item_id, worker_id = ?worker_id, attempts, reason, "Item requeued");
            TimeoutOutcome::Requeued {
                item_id,
                worker_id,
                attempts,
            }
        } else {
            warn!(item_id = %item_id, worker_id = ?worker_id, attempts, reason, "Item aborted, attempts exhausted");
            TimeoutOutcome::Aborted {
                item_id,
                worker_id,
                attempts,
            }
        };
        Ok(outcome)
    }

    /// Mark a worker disconnected and hand its item back to the retry policy.
    pub async fn disconnect_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<TimeoutOutcome>, WorkerError> {
        let now = Utc::now();
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;

        let (event, held) = registry.disconnect(worker_id, now)?;
        self.registry.persist_event(&event).await;

        let outcome = match held {
            Some(item_id) => {
                match self
                    .release_held(&mut queue, &mut registry, item_id, "worker disconnected", now)
                    .await
                {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(item_id = %item_id, worker_id, error = %e, "Held item was not releasable");
                        release(&mut registry, worker_id, item_id);
                        None
                    }
                }
            }
            None => None,
        };

        info!(worker_id, released = outcome.is_some(), "Worker disconnected");
        Ok(outcome)
    }
}

/// Free `worker_id` from `item_id`, logging if the registry disagrees.
pub(super) fn release(registry: &mut RegistryState, worker_id: &str, item_id: Uuid) {
    if let Err(e) = registry.mark_idle(worker_id, item_id) {
        warn!(worker_id, item_id = %item_id, error = %e, "Could not release worker");
    }
}

/// Spawn a background task that periodically expires overdue items.
pub fn spawn_timeout_sweep(
    tracker: Arc<LifecycleTracker>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            tracker.sweep_timeouts().await;
        }
    })
}
