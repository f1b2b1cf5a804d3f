//! Dispatcher: wires the queue, registry, tracker, scheduler, compliance
//! monitor and report aggregator around one shared configuration.
//!
//! The HTTP layer and tests talk to this type; nothing below it knows about
//! transports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::{
    Assignment, AssignmentScheduler, ChatRead, ItemEvent, LifecycleTracker, MessageRead, Role,
    TimeoutOutcome, WorkItem, WorkQueue, WorkerSignal, spawn_timeout_sweep,
};
use crate::error::Error;
use crate::fingerprint::{WorkParameters, WorkerConfig};
use crate::reports::{ReportAggregator, ReportKind, ReportOutcome};
use crate::store::Database;
use crate::workers::{
    ComplianceMonitor, ComplianceProbe, RegisteredWorker, Worker, WorkerRegistry,
    spawn_compliance_task,
};

/// What `recover` reloaded from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub workers: usize,
    pub events: usize,
    pub messages: usize,
    /// Items that were held by a worker and went back to pending.
    pub requeued: usize,
}

pub struct Dispatcher {
    config: DispatchConfig,
    queue: Arc<WorkQueue>,
    registry: Arc<WorkerRegistry>,
    tracker: Arc<LifecycleTracker>,
    scheduler: AssignmentScheduler,
    compliance: Arc<ComplianceMonitor>,
    reports: ReportAggregator,
    store: Option<Arc<dyn Database>>,
}

impl Dispatcher {
    /// In-memory dispatcher.
    pub fn new(config: DispatchConfig) -> Self {
        Self::build(config, None)
    }

    /// Dispatcher that writes every change through to `store`.
    pub fn with_store(config: DispatchConfig, store: Arc<dyn Database>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: DispatchConfig, store: Option<Arc<dyn Database>>) -> Self {
        let (queue, registry) = match store {
            Some(ref db) => (
                WorkQueue::with_store(config.event_capacity, Arc::clone(db)),
                WorkerRegistry::with_store(Arc::clone(db)),
            ),
            None => (WorkQueue::new(config.event_capacity), WorkerRegistry::new()),
        };
        let queue = Arc::new(queue);
        let registry = Arc::new(registry);

        let tracker = Arc::new(LifecycleTracker::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            &config,
        ));
        let scheduler = AssignmentScheduler::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&tracker),
        );
        let compliance = Arc::new(ComplianceMonitor::new(Arc::clone(&registry), &config));
        let reports = ReportAggregator::new(Arc::clone(&queue), Arc::clone(&compliance), &config);

        Self {
            config,
            queue,
            registry,
            tracker,
            scheduler,
            compliance,
            reports,
            store,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn compliance(&self) -> &Arc<ComplianceMonitor> {
        &self.compliance
    }

    /// Subscribe to item state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.queue.subscribe()
    }

    /// Reload workers, events, messages and reports from the store.
    /// A no-op without a store.
    pub async fn recover(&self) -> Result<RecoveryStats, Error> {
        let Some(ref store) = self.store else {
            return Ok(RecoveryStats::default());
        };

        let workers = store.list_workers().await?;
        let events = store.list_worker_events().await?;
        let messages = store.list_messages().await?;

        let mut stats = RecoveryStats {
            workers: workers.len(),
            events: events.len(),
            messages: messages.len(),
            requeued: 0,
        };
        self.registry.restore(workers, events).await;
        stats.requeued = self.queue.restore(messages).await;

        info!(
            workers = stats.workers,
            messages = stats.messages,
            requeued = stats.requeued,
            "Dispatcher state recovered"
        );
        Ok(stats)
    }

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker connection, then try to hand it pending work.
    /// A returning worker must present the key issued on first connect.
    pub async fn connect_worker(
        &self,
        worker_id: &str,
        name: &str,
        config: WorkerConfig,
        api_key: Option<&str>,
    ) -> Result<RegisteredWorker, Error> {
        let registered = self
            .registry
            .register(worker_id, name, config, api_key)
            .await?;
        self.scheduler.schedule_pass().await;
        Ok(registered)
    }

    pub async fn disconnect_worker(&self, worker_id: &str) -> Result<Option<TimeoutOutcome>, Error> {
        let outcome = self.tracker.disconnect_worker(worker_id).await?;
        if outcome.is_some() {
            self.scheduler.schedule_pass().await;
        }
        Ok(outcome)
    }

    pub async fn authenticate(&self, api_key: &str) -> Option<String> {
        self.registry.authenticate(api_key).await
    }

    pub async fn poll_for_work(&self, worker_id: &str) -> Result<Option<Assignment>, Error> {
        Ok(self.scheduler.poll_for_work(worker_id).await?)
    }

    pub async fn schedule_pass(&self) -> Vec<Assignment> {
        self.scheduler.schedule_pass().await
    }

    pub async fn apply_signal(&self, signal: WorkerSignal) -> Result<MessageRead, Error> {
        let item = self.tracker.apply_signal(signal).await?;
        if item.state.is_terminal() {
            // the worker is free again
            self.scheduler.schedule_pass().await;
        }
        Ok(item.to_read())
    }

    pub async fn schedule_check(&self, worker_id: &str, at: DateTime<Utc>) -> Result<Worker, Error> {
        Ok(self.compliance.schedule_check(worker_id, at).await?)
    }

    /// Resolve a compliance check from outside (e.g. an operator or an
    /// external verifier).
    pub async fn complete_check(&self, worker_id: &str, passed: bool) -> Result<Worker, Error> {
        let worker = self.compliance.complete_check(worker_id, passed).await?;
        if passed {
            self.scheduler.schedule_pass().await;
        }
        Ok(worker)
    }

    // ── Conversations ───────────────────────────────────────────────

    /// Create an item that needs a generated reply and try to assign it.
    pub async fn create_item(
        &self,
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        work_parameters: WorkParameters,
    ) -> Result<WorkItem, Error> {
        let item = self
            .queue
            .create_item(conversation_id, parent_id, role, work_parameters)
            .await?;
        let assigned = self.scheduler.schedule_pass().await;
        debug!(item_id = %item.id, assigned = assigned.len(), "Scheduled after create");
        Ok(item)
    }

    pub async fn record_message(
        &self,
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        content: String,
    ) -> Result<WorkItem, Error> {
        self.queue
            .record_message(conversation_id, parent_id, role, content)
            .await
    }

    pub async fn cancel(&self, item_id: Uuid) -> Result<MessageRead, Error> {
        let item = self.tracker.cancel(item_id).await?;
        self.scheduler.schedule_pass().await;
        Ok(item.to_read())
    }

    pub async fn submit_report(
        &self,
        item_id: Uuid,
        kind: ReportKind,
        reason: &str,
    ) -> Result<ReportOutcome, Error> {
        self.reports.apply_report(item_id, kind, reason).await
    }

    pub async fn message(&self, item_id: Uuid) -> Result<MessageRead, Error> {
        Ok(self.queue.message(item_id).await?)
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> Option<ChatRead> {
        self.queue.conversation(conversation_id).await
    }

    /// Start the timeout sweep and the compliance cadence. `probe`, when
    /// given, resolves due checks automatically.
    pub fn spawn_background(&self, probe: Option<Arc<dyn ComplianceProbe>>) -> Vec<JoinHandle<()>> {
        vec![
            spawn_timeout_sweep(Arc::clone(&self.tracker), self.config.sweep_interval),
            spawn_compliance_task(
                Arc::clone(&self.compliance),
                probe,
                self.config.compliance_poll_interval,
            ),
        ]
    }
}
