//! Work queue: every item ever created, the FIFO pending set, and
//! id-based indexes by conversation and by handling worker.
//!
//! State changes are broadcast as [`ItemEvent`]s so the conversation
//! boundary can follow items without polling.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockWriteGuard, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::item::{ChatRead, MessageRead, Role, WorkItem};
use super::state::MessageState;
use crate::error::{Error, ItemError};
use crate::fingerprint::WorkParameters;
use crate::reports::Report;
use crate::store::Database;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification emitted whenever an item changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEvent {
    pub item_id: Uuid,
    pub conversation_id: Uuid,
    pub state: MessageState,
    pub worker_id: Option<String>,
    pub attempts: u32,
}

impl From<&WorkItem> for ItemEvent {
    fn from(item: &WorkItem) -> Self {
        Self {
            item_id: item.id,
            conversation_id: item.conversation_id,
            state: item.state,
            worker_id: item.worker_id.clone(),
            attempts: item.attempts,
        }
    }
}

/// Lock-protected queue contents.
#[derive(Debug, Default)]
pub struct QueueState {
    items: HashMap<Uuid, WorkItem>,
    /// Pending item ids keyed by arrival sequence.
    pending: BTreeMap<u64, Uuid>,
    /// Items currently assigned or in progress.
    held: HashSet<Uuid>,
    arrival: HashMap<Uuid, u64>,
    next_seq: u64,
    by_conversation: HashMap<Uuid, Vec<Uuid>>,
    /// Items each worker finished (complete or error), oldest first.
    by_worker: HashMap<String, Vec<Uuid>>,
}

impl QueueState {
    pub fn get(&self, id: Uuid) -> Result<&WorkItem, ItemError> {
        self.items.get(&id).ok_or(ItemError::NotFound { id })
    }

    pub fn get_mut(&mut self, id: Uuid) -> Result<&mut WorkItem, ItemError> {
        self.items.get_mut(&id).ok_or(ItemError::NotFound { id })
    }

    fn insert(&mut self, item: WorkItem) {
        let id = item.id;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.arrival.insert(id, seq);
        self.by_conversation
            .entry(item.conversation_id)
            .or_default()
            .push(id);
        if let Some(worker) = item.handled_by.clone() {
            self.by_worker.entry(worker).or_default().push(id);
        }
        self.items.insert(id, item);
        self.track(id);
    }

    /// Pending ids, oldest arrival first.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.values().copied().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids of items currently held by a worker.
    pub fn held_ids(&self) -> Vec<Uuid> {
        self.held.iter().copied().collect()
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Bring the pending and held indexes in line with the item's state.
    /// Call after every state change made through [`QueueState::get_mut`].
    pub(crate) fn track(&mut self, id: Uuid) {
        let Some(state) = self.items.get(&id).map(|i| i.state) else {
            return;
        };
        if state == MessageState::Pending {
            self.enqueue(id);
        } else {
            self.remove_pending(id);
        }
        if state.holds_worker() {
            self.held.insert(id);
        } else {
            self.held.remove(&id);
        }
    }

    pub(crate) fn remove_pending(&mut self, id: Uuid) -> bool {
        match self.arrival.get(&id) {
            Some(seq) => self.pending.remove(seq).is_some(),
            None => false,
        }
    }

    /// Put an item back into the pending set at its original arrival position.
    pub(crate) fn enqueue(&mut self, id: Uuid) {
        if let Some(&seq) = self.arrival.get(&id) {
            self.pending.insert(seq, id);
        }
    }

    pub(crate) fn record_handled(&mut self, worker_id: &str, id: Uuid) {
        self.by_worker
            .entry(worker_id.to_string())
            .or_default()
            .push(id);
    }

    /// The last `window` items the worker finished, newest first.
    pub fn recent_for_worker(&self, worker_id: &str, window: usize) -> Vec<&WorkItem> {
        self.by_worker
            .get(worker_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .take(window)
                    .filter_map(|id| self.items.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared store of work items.
pub struct WorkQueue {
    state: RwLock<QueueState>,
    tx: broadcast::Sender<ItemEvent>,
    store: Option<Arc<dyn Database>>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl WorkQueue {
    /// Create an in-memory queue.
    pub fn new(event_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(event_capacity.max(1));
        Self {
            state: RwLock::new(QueueState::default()),
            tx,
            store: None,
        }
    }

    /// Create a queue that writes items through to `store`.
    pub fn with_store(event_capacity: usize, store: Arc<dyn Database>) -> Self {
        let mut queue = Self::new(event_capacity);
        queue.store = Some(store);
        queue
    }

    /// Subscribe to item change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.tx.subscribe()
    }

    /// Create a pending item that needs a generated reply.
    pub async fn create_item(
        &self,
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        work_parameters: WorkParameters,
    ) -> Result<WorkItem, Error> {
        let item = WorkItem::pending(conversation_id, parent_id, role, work_parameters)?;
        self.insert_checked(item).await
    }

    /// Record a message whose content already exists.
    pub async fn record_message(
        &self,
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        content: String,
    ) -> Result<WorkItem, Error> {
        let item = WorkItem::recorded(conversation_id, parent_id, role, content);
        self.insert_checked(item).await
    }

    async fn insert_checked(&self, item: WorkItem) -> Result<WorkItem, Error> {
        let mut state = self.state.write().await;
        if let Some(parent_id) = item.parent_id {
            let parent = state.get(parent_id)?;
            if parent.conversation_id != item.conversation_id {
                return Err(ItemError::ParentMismatch {
                    parent_id,
                    conversation_id: item.conversation_id,
                }
                .into());
            }
        }

        state.insert(item.clone());
        self.commit(&item).await;
        drop(state);

        info!(
            item_id = %item.id,
            conversation_id = %item.conversation_id,
            role = item.role.as_str(),
            state = %item.state,
            "Item created"
        );
        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkItem, ItemError> {
        self.state.read().await.get(id).cloned()
    }

    /// Read projection of a single message.
    pub async fn message(&self, id: Uuid) -> Result<MessageRead, ItemError> {
        Ok(self.state.read().await.get(id)?.to_read())
    }

    /// Read projection of a conversation, or `None` if it has no messages.
    pub async fn conversation(&self, conversation_id: Uuid) -> Option<ChatRead> {
        let state = self.state.read().await;
        let ids = state.by_conversation.get(&conversation_id)?;
        let mut items: Vec<&WorkItem> = ids.iter().filter_map(|id| state.items.get(id)).collect();
        items.sort_by_key(|i| (i.created_at, state.arrival.get(&i.id).copied()));
        Some(ChatRead {
            id: conversation_id,
            messages: items.into_iter().map(WorkItem::to_read).collect(),
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending_len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Reload items from storage. Items that were held by a worker when the
    /// process stopped go back to pending. Returns how many were requeued.
    pub async fn restore(&self, mut items: Vec<WorkItem>) -> usize {
        items.sort_by_key(|i| i.created_at);
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut requeued = 0;

        for mut item in items {
            if item.state.holds_worker() {
                match item.requeue("restored after restart", now) {
                    Ok(_) => {
                        requeued += 1;
                        self.persist(&item).await;
                    }
                    Err(e) => warn!(item_id = %item.id, error = %e, "Could not requeue restored item"),
                }
            }
            state.insert(item);
        }

        debug!(
            total = state.items.len(),
            pending = state.pending_len(),
            requeued,
            "Work queue restored"
        );
        requeued
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().await
    }

    /// Persist and broadcast an item after a mutation. Callers hold the
    /// queue write lock so writes for one item reach the store in order.
    pub(crate) async fn commit(&self, item: &WorkItem) {
        self.persist(item).await;
        // ok if nobody is subscribed
        let _ = self.tx.send(ItemEvent::from(item));
    }

    async fn persist(&self, item: &WorkItem) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.upsert_message(item).await {
                warn!(item_id = %item.id, error = %e, "Failed to persist item");
            }
        }
    }

    pub(crate) async fn persist_report(&self, report: &Report) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.insert_report(report).await {
                warn!(report_id = %report.id, error = %e, "Failed to persist report");
            }
        }
    }
}
