//! `Database` trait: single async interface for the dispatch audit store.

use async_trait::async_trait;
use uuid::Uuid;

use crate::dispatch::WorkItem;
use crate::error::DatabaseError;
use crate::reports::Report;
use crate::workers::{Worker, WorkerEvent};

/// Backend-agnostic persistence for workers, worker events, messages and
/// reports. Writes are idempotent upserts or appends.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create tables and apply pending migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    /// Append a connect/disconnect event.
    async fn insert_worker_event(&self, event: &WorkerEvent) -> Result<(), DatabaseError>;

    /// All worker events, oldest first.
    async fn list_worker_events(&self) -> Result<Vec<WorkerEvent>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn upsert_message(&self, item: &WorkItem) -> Result<(), DatabaseError>;

    /// Load one message with its reports attached.
    async fn get_message(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError>;

    /// Load every message with reports attached, oldest first.
    async fn list_messages(&self) -> Result<Vec<WorkItem>, DatabaseError>;

    // ── Reports ─────────────────────────────────────────────────────

    async fn insert_report(&self, report: &Report) -> Result<(), DatabaseError>;

    async fn list_reports(&self, message_id: Uuid) -> Result<Vec<Report>, DatabaseError>;
}
