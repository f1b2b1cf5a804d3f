//! Assignment scheduler: matches pending items to eligible idle workers.
//!
//! Claims happen under the queue write lock and then the registry write
//! lock, so two concurrent passes can never observe the same worker as free.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::item::WorkItem;
use super::lifecycle::{LifecycleTracker, release};
use super::queue::{QueueState, WorkQueue};
use crate::error::WorkerError;
use crate::fingerprint::{Fingerprint, WorkParameters};
use crate::workers::WorkerRegistry;
use crate::workers::registry::RegistryState;

/// What a worker receives when it is given an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub item_id: Uuid,
    pub conversation_id: Uuid,
    pub worker_id: String,
    pub work_parameters: WorkParameters,
    pub fingerprint: Fingerprint,
    /// 1 for the first claim, higher after requeues.
    pub attempt: u32,
    pub assigned_at: DateTime<Utc>,
}

impl Assignment {
    fn from_item(item: &WorkItem, worker_id: &str) -> Option<Self> {
        Some(Self {
            item_id: item.id,
            conversation_id: item.conversation_id,
            worker_id: worker_id.to_string(),
            work_parameters: item.work_parameters.clone()?,
            fingerprint: item.fingerprint.clone()?,
            attempt: item.attempts,
            assigned_at: item.work_begin_at?,
        })
    }
}

pub struct AssignmentScheduler {
    queue: Arc<WorkQueue>,
    registry: Arc<WorkerRegistry>,
    tracker: Arc<LifecycleTracker>,
}

impl AssignmentScheduler {
    pub fn new(
        queue: Arc<WorkQueue>,
        registry: Arc<WorkerRegistry>,
        tracker: Arc<LifecycleTracker>,
    ) -> Self {
        Self {
            queue,
            registry,
            tracker,
        }
    }

    pub async fn schedule_pass(&self) -> Vec<Assignment> {
        self.schedule_pass_at(Utc::now()).await
    }

    /// Expire overdue items, then walk the pending set oldest first and give
    /// each item to the first eligible idle worker, if any.
    pub async fn schedule_pass_at(&self, now: DateTime<Utc>) -> Vec<Assignment> {
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;

        self.tracker
            .expire_overdue(&mut queue, &mut registry, now)
            .await;

        let mut assignments = Vec::new();
        // fingerprints already found to have no free worker in this pass
        let mut exhausted: HashSet<Fingerprint> = HashSet::new();

        for item_id in queue.pending_ids() {
            let Some(fingerprint) = queue.get(item_id).ok().and_then(|i| i.fingerprint.clone())
            else {
                continue;
            };
            if exhausted.contains(&fingerprint) {
                continue;
            }

            let idle: Vec<String> = registry
                .eligible_workers(&fingerprint)
                .into_iter()
                .filter(|id| registry.get(id).map(|r| r.is_idle()).unwrap_or(false))
                .collect();
            if idle.is_empty() {
                exhausted.insert(fingerprint);
                continue;
            }

            // idle workers may all have lost this item before; later items
            // with the same fingerprint can still use them
            let Some(worker_id) = idle
                .into_iter()
                .find(|id| queue.get(item_id).map(|i| !i.excludes(id)).unwrap_or(false))
            else {
                continue;
            };

            if let Some(assignment) = self
                .claim(&mut queue, &mut registry, item_id, &worker_id, now)
                .await
            {
                assignments.push(assignment);
            }
        }

        if assignments.is_empty() {
            debug!(pending = queue.pending_len(), "Scheduling pass assigned nothing");
        } else {
            debug!(
                assigned = assignments.len(),
                pending = queue.pending_len(),
                "Scheduling pass complete"
            );
        }
        assignments
    }

    pub async fn poll_for_work(&self, worker_id: &str) -> Result<Option<Assignment>, WorkerError> {
        self.poll_for_work_at(worker_id, Utc::now()).await
    }

    /// Give the polling worker something to do. A worker that already holds
    /// an item gets that item again; otherwise it claims the oldest pending
    /// item matching its fingerprint. `None` means nothing is available.
    pub async fn poll_for_work_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>, WorkerError> {
        let mut queue = self.queue.write().await;
        let mut registry = self.registry.write().await;

        self.tracker
            .expire_overdue(&mut queue, &mut registry, now)
            .await;

        let record = registry.get(worker_id)?;
        if let Some(held) = record.active_item {
            return Ok(queue
                .get(held)
                .ok()
                .and_then(|item| Assignment::from_item(item, worker_id)));
        }

        let Some(fingerprint) = record.fingerprint.clone() else {
            return Ok(None);
        };
        if !record.is_eligible_for(&fingerprint) {
            debug!(worker_id, "Polling worker is not eligible");
            return Ok(None);
        }

        let next = queue.pending_ids().into_iter().find(|id| {
            queue
                .get(*id)
                .map(|item| {
                    item.fingerprint.as_ref() == Some(&fingerprint) && !item.excludes(worker_id)
                })
                .unwrap_or(false)
        });

        match next {
            Some(item_id) => Ok(self
                .claim(&mut queue, &mut registry, item_id, worker_id, now)
                .await),
            None => Ok(None),
        }
    }

    /// Check-and-set over the item and the worker. Either both change or
    /// neither does.
    async fn claim(
        &self,
        queue: &mut QueueState,
        registry: &mut RegistryState,
        item_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        let config = registry.get(worker_id).ok()?.config.clone();

        let item = queue.get_mut(item_id).ok()?;
        if item.state != super::state::MessageState::Pending || item.excludes(worker_id) {
            return None;
        }
        if !registry.mark_busy(worker_id, item_id).ok()? {
            return None;
        }
        if let Err(e) = item.assign(worker_id, config, now) {
            debug!(item_id = %item_id, worker_id, error = %e, "Claim rejected");
            release(registry, worker_id, item_id);
            return None;
        }
        let item = item.clone();
        queue.track(item_id);
        self.queue.commit(&item).await;

        info!(
            item_id = %item_id,
            worker_id,
            attempt = item.attempts,
            "Item assigned"
        );
        Assignment::from_item(&item, worker_id)
    }
}
