//! Worker registry: the authoritative set of known workers, their latest
//! fingerprint, connection status and current assignment.
//!
//! The registry never touches work items. Components that must change an
//! item and a worker together (claim, release) take the queue lock first and
//! this registry's lock second, then operate on [`RegistryState`] directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Worker, WorkerEvent, WorkerEventType};
use crate::error::{Error, WorkerError};
use crate::fingerprint::{Fingerprint, WorkerConfig};
use crate::store::Database;

/// Registry-side view of a worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker: Worker,
    pub config: Option<WorkerConfig>,
    pub fingerprint: Option<Fingerprint>,
    pub connected: bool,
    /// Item this worker currently holds, if any. At most one.
    pub active_item: Option<Uuid>,
}

impl WorkerRecord {
    fn new(worker: Worker) -> Self {
        Self {
            worker,
            config: None,
            fingerprint: None,
            connected: false,
            active_item: None,
        }
    }

    /// Connected, out of compliance check, and serving `fingerprint`.
    pub fn is_eligible_for(&self, fingerprint: &Fingerprint) -> bool {
        self.connected
            && !self.worker.in_compliance_check
            && self.fingerprint.as_ref() == Some(fingerprint)
    }

    pub fn is_idle(&self) -> bool {
        self.active_item.is_none()
    }
}

/// Returned from registration. The credential is revealed only when the
/// worker is first created.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredWorker {
    pub worker_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub fingerprint: Fingerprint,
    /// Item the worker still holds from before this connection, if any.
    pub active_item: Option<Uuid>,
}

/// Lock-protected registry contents.
#[derive(Debug, Default)]
pub struct RegistryState {
    workers: HashMap<String, WorkerRecord>,
    events: Vec<WorkerEvent>,
}

impl RegistryState {
    pub fn get(&self, worker_id: &str) -> Result<&WorkerRecord, WorkerError> {
        self.workers.get(worker_id).ok_or_else(|| WorkerError::Unknown {
            id: worker_id.to_string(),
        })
    }

    fn get_mut(&mut self, worker_id: &str) -> Result<&mut WorkerRecord, WorkerError> {
        self.workers
            .get_mut(worker_id)
            .ok_or_else(|| WorkerError::Unknown {
                id: worker_id.to_string(),
            })
    }

    /// Connected, compliance-clear workers serving `fingerprint`, sorted by id.
    pub fn eligible_workers(&self, fingerprint: &Fingerprint) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .values()
            .filter(|r| r.is_eligible_for(fingerprint))
            .map(|r| r.worker.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Check-and-set: give `item_id` to the worker only if it holds nothing.
    pub fn mark_busy(&mut self, worker_id: &str, item_id: Uuid) -> Result<bool, WorkerError> {
        let record = self.get_mut(worker_id)?;
        if record.active_item.is_some() {
            return Ok(false);
        }
        record.active_item = Some(item_id);
        Ok(true)
    }

    /// Release the worker, but only from the item it actually holds.
    pub fn mark_idle(&mut self, worker_id: &str, item_id: Uuid) -> Result<bool, WorkerError> {
        let record = self.get_mut(worker_id)?;
        if record.active_item != Some(item_id) {
            return Ok(false);
        }
        record.active_item = None;
        Ok(true)
    }

    /// Mark a worker disconnected. Returns the event and the item it held.
    pub fn disconnect(
        &mut self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(WorkerEvent, Option<Uuid>), WorkerError> {
        let record = self.get_mut(worker_id)?;
        record.connected = false;
        let held = record.active_item;
        let event = WorkerEvent::new(
            worker_id,
            WorkerEventType::Disconnect,
            record.config.clone(),
            now,
        );
        self.events.push(event.clone());
        Ok((event, held))
    }

    fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workers
            .values()
            .filter(|r| r.connected)
            .map(|r| r.worker.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Authoritative, concurrently shared set of workers.
pub struct WorkerRegistry {
    state: RwLock<RegistryState>,
    store: Option<Arc<dyn Database>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    /// Create an in-memory registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: None,
        }
    }

    /// Create a registry that writes workers and events through to `store`.
    pub fn with_store(store: Arc<dyn Database>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            store: Some(store),
        }
    }

    /// Record a connection. Creates the worker on first sight; a known
    /// worker must present the key it was issued.
    pub async fn register(
        &self,
        worker_id: &str,
        name: &str,
        config: WorkerConfig,
        api_key: Option<&str>,
    ) -> Result<RegisteredWorker, Error> {
        self.register_at(worker_id, name, config, api_key, Utc::now())
            .await
    }

    pub async fn register_at(
        &self,
        worker_id: &str,
        name: &str,
        config: WorkerConfig,
        api_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RegisteredWorker, Error> {
        let fingerprint = config.fingerprint()?;

        let mut state = self.state.write().await;
        let is_new = match state.workers.get(worker_id) {
            Some(existing) => {
                if api_key != Some(existing.worker.api_key.expose_secret()) {
                    warn!(worker_id, "Reconnect rejected, credential mismatch");
                    return Err(WorkerError::Unauthorized {
                        id: worker_id.to_string(),
                    }
                    .into());
                }
                false
            }
            None => true,
        };
        let record = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerRecord::new(Worker::new(worker_id, name)));

        if record.fingerprint.as_ref() != Some(&fingerprint) && record.fingerprint.is_some() {
            info!(
                worker_id,
                old = %record.fingerprint.as_ref().map(|f| f.as_str()).unwrap_or_default(),
                new = %fingerprint,
                "Worker changed configuration"
            );
        }
        record.worker.name = name.to_string();
        record.config = Some(config.clone());
        record.fingerprint = Some(fingerprint.clone());
        record.connected = true;

        let registered = RegisteredWorker {
            worker_id: worker_id.to_string(),
            api_key: is_new.then(|| record.worker.api_key.expose_secret().to_string()),
            fingerprint: fingerprint.clone(),
            active_item: record.active_item,
        };
        let worker = record.worker.clone();

        let event = WorkerEvent::new(worker_id, WorkerEventType::Connect, Some(config), now);
        state.events.push(event.clone());

        self.persist_worker(&worker).await;
        self.persist_event(&event).await;
        drop(state);

        info!(worker_id, fingerprint = %fingerprint, is_new, "Worker connected");
        Ok(registered)
    }

    /// Connected, compliance-clear workers serving `fingerprint`.
    pub async fn eligible_workers(&self, fingerprint: &Fingerprint) -> Vec<String> {
        self.state.read().await.eligible_workers(fingerprint)
    }

    /// Ids of all currently connected workers.
    pub async fn connected_workers(&self) -> Vec<String> {
        self.state.read().await.connected_ids()
    }

    pub async fn get(&self, worker_id: &str) -> Result<Worker, WorkerError> {
        Ok(self.state.read().await.get(worker_id)?.worker.clone())
    }

    pub async fn record(&self, worker_id: &str) -> Result<WorkerRecord, WorkerError> {
        Ok(self.state.read().await.get(worker_id)?.clone())
    }

    pub async fn mark_busy(&self, worker_id: &str, item_id: Uuid) -> Result<bool, WorkerError> {
        self.state.write().await.mark_busy(worker_id, item_id)
    }

    pub async fn mark_idle(&self, worker_id: &str, item_id: Uuid) -> Result<bool, WorkerError> {
        self.state.write().await.mark_idle(worker_id, item_id)
    }

    /// Resolve a credential to the worker it was issued to.
    pub async fn authenticate(&self, api_key: &str) -> Option<String> {
        self.state
            .read()
            .await
            .workers
            .values()
            .find(|r| r.worker.api_key.expose_secret() == api_key)
            .map(|r| r.worker.id.clone())
    }

    /// Configuration the worker last connected with at or before `time`.
    pub async fn config_at(
        &self,
        worker_id: &str,
        time: DateTime<Utc>,
    ) -> Result<Option<WorkerConfig>, WorkerError> {
        let state = self.state.read().await;
        state.get(worker_id)?;
        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.worker_id == worker_id
                    && e.event_type == WorkerEventType::Connect
                    && e.time <= time
            })
            .max_by_key(|e| e.time)
            .and_then(|e| e.worker_config.clone()))
    }

    /// Event history for one worker, oldest first.
    pub async fn events(&self, worker_id: &str) -> Vec<WorkerEvent> {
        let mut events: Vec<WorkerEvent> = self
            .state
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.worker_id == worker_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.time);
        events
    }

    /// Mutate the worker's persisted fields and write them through.
    ///
    /// Only the compliance monitor calls this.
    pub(crate) async fn update_worker<F>(&self, worker_id: &str, f: F) -> Result<Worker, WorkerError>
    where
        F: FnOnce(&mut Worker),
    {
        let mut state = self.state.write().await;
        let record = state.get_mut(worker_id)?;
        f(&mut record.worker);
        let worker = record.worker.clone();
        self.persist_worker(&worker).await;
        Ok(worker)
    }

    /// Reload workers and their events from storage. Restored workers start
    /// disconnected and idle; their fingerprint comes from the last connect.
    pub async fn restore(&self, workers: Vec<Worker>, events: Vec<WorkerEvent>) {
        let mut state = self.state.write().await;
        for worker in workers {
            let last_config = events
                .iter()
                .filter(|e| e.worker_id == worker.id && e.event_type == WorkerEventType::Connect)
                .max_by_key(|e| e.time)
                .and_then(|e| e.worker_config.clone());
            let mut record = WorkerRecord::new(worker);
            record.fingerprint = last_config.as_ref().and_then(|c| c.fingerprint().ok());
            record.config = last_config;
            state.workers.insert(record.worker.id.clone(), record);
        }
        state.events.extend(events);
        debug!(count = state.workers.len(), "Worker registry restored");
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().await
    }

    async fn persist_worker(&self, worker: &Worker) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.upsert_worker(worker).await {
                warn!(worker_id = %worker.id, error = %e, "Failed to persist worker");
            }
        }
    }

    pub(crate) async fn persist_event(&self, event: &WorkerEvent) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.insert_worker_event(event).await {
                warn!(worker_id = %event.worker_id, error = %e, "Failed to persist worker event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ModelConfig;

    fn config(model_id: &str) -> WorkerConfig {
        WorkerConfig {
            model: ModelConfig {
                model_id: model_id.to_string(),
                max_input_length: 512,
                max_total_length: 1024,
            },
            plugins: vec![],
            max_parallel_requests: 1,
        }
    }

    #[tokio::test]
    async fn register_makes_worker_eligible() {
        let registry = WorkerRegistry::new();
        let reg = registry.register("w1", "Worker 1", config("m"), None).await.unwrap();
        assert_eq!(reg.fingerprint, config("m").fingerprint().unwrap());
        assert_eq!(registry.eligible_workers(&reg.fingerprint).await, vec!["w1"]);
    }

    #[tokio::test]
    async fn register_rejects_invalid_config() {
        let registry = WorkerRegistry::new();
        assert!(registry.register("w1", "W", config(""), None).await.is_err());
        assert!(registry.get("w1").await.is_err());
    }

    #[tokio::test]
    async fn re_register_requires_credential_and_updates_fingerprint() {
        let registry = WorkerRegistry::new();
        let first = registry.register("w1", "W", config("a"), None).await.unwrap();
        let key = first.api_key.clone().unwrap();
        let second = registry
            .register("w1", "W", config("b"), Some(&key))
            .await
            .unwrap();
        // the key is only revealed on first registration
        assert!(second.api_key.is_none());
        assert_eq!(registry.authenticate(&key).await.as_deref(), Some("w1"));
        assert_ne!(first.fingerprint, second.fingerprint);
        assert!(registry.eligible_workers(&first.fingerprint).await.is_empty());
        assert_eq!(registry.eligible_workers(&second.fingerprint).await, vec!["w1"]);
        assert_eq!(registry.events("w1").await.len(), 2);
    }

    #[tokio::test]
    async fn eligible_workers_are_sorted_and_filtered() {
        let registry = WorkerRegistry::new();
        let fp = config("m").fingerprint().unwrap();
        registry.register("w3", "W3", config("m"), None).await.unwrap();
        registry.register("w1", "W1", config("m"), None).await.unwrap();
        registry.register("w2", "W2", config("other"), None).await.unwrap();
        assert_eq!(registry.eligible_workers(&fp).await, vec!["w1", "w3"]);

        registry
            .update_worker("w1", |w| w.in_compliance_check = true)
            .await
            .unwrap();
        assert_eq!(registry.eligible_workers(&fp).await, vec!["w3"]);
    }

    #[tokio::test]
    async fn mark_busy_is_check_and_set() {
        let registry = WorkerRegistry::new();
        registry.register("w1", "W", config("m"), None).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(registry.mark_busy("w1", a).await.unwrap());
        assert!(!registry.mark_busy("w1", b).await.unwrap());
        assert!(!registry.mark_idle("w1", b).await.unwrap());
        assert!(registry.mark_idle("w1", a).await.unwrap());
        assert!(registry.mark_busy("w1", b).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_worker_is_reported() {
        let registry = WorkerRegistry::new();
        let err = registry.mark_busy("ghost", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Unknown { ref id } if id == "ghost"));
    }

    #[tokio::test]
    async fn disconnected_worker_is_not_eligible() {
        let registry = WorkerRegistry::new();
        let reg = registry.register("w1", "W", config("m"), None).await.unwrap();
        let (event, held) = registry.write().await.disconnect("w1", Utc::now()).unwrap();
        assert_eq!(event.event_type, WorkerEventType::Disconnect);
        assert!(held.is_none());
        assert!(registry.eligible_workers(&reg.fingerprint).await.is_empty());

        registry
            .register("w1", "W", config("m"), reg.api_key.as_deref())
            .await
            .unwrap();
        assert_eq!(registry.eligible_workers(&reg.fingerprint).await, vec!["w1"]);
    }

    #[tokio::test]
    async fn reconnect_without_matching_key_is_rejected() {
        let registry = WorkerRegistry::new();
        let reg = registry.register("w1", "W", config("m"), None).await.unwrap();
        registry.write().await.disconnect("w1", Utc::now()).unwrap();

        for presented in [None, Some("stolen")] {
            let err = registry
                .register("w1", "Impostor", config("other"), presented)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Worker(WorkerError::Unauthorized { ref id }) if id == "w1"
            ));
        }

        // nothing about the worker changed
        let record = registry.record("w1").await.unwrap();
        assert!(!record.connected);
        assert_eq!(record.worker.name, "W");
        assert_eq!(record.fingerprint, Some(reg.fingerprint));
        assert_eq!(registry.events("w1").await.len(), 2);
    }

    #[tokio::test]
    async fn authenticate_resolves_issued_key() {
        let registry = WorkerRegistry::new();
        let reg = registry.register("w1", "W", config("m"), None).await.unwrap();
        let key = reg.api_key.unwrap();
        assert_eq!(registry.authenticate(&key).await.as_deref(), Some("w1"));
        assert!(registry.authenticate("bogus").await.is_none());
    }

    #[tokio::test]
    async fn every_connect_is_written_through() {
        use crate::store::LibSqlBackend;

        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = WorkerRegistry::with_store(Arc::clone(&store));
        let reg = registry.register("w1", "Old name", config("m"), None).await.unwrap();
        registry
            .register("w1", "New name", config("m"), reg.api_key.as_deref())
            .await
            .unwrap();

        let stored = store.list_workers().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "New name");
        assert_eq!(store.list_worker_events().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn config_at_reconstructs_history() {
        let registry = WorkerRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);
        let reg = registry
            .register_at("w1", "W", config("a"), None, t0)
            .await
            .unwrap();
        registry
            .register_at("w1", "W", config("b"), reg.api_key.as_deref(), t1)
            .await
            .unwrap();

        let before = registry
            .config_at("w1", t0 - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(before.is_none());
        let mid = registry
            .config_at("w1", t0 + chrono::Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mid.model.model_id, "a");
        let after = registry.config_at("w1", t1).await.unwrap().unwrap();
        assert_eq!(after.model.model_id, "b");
    }
}
