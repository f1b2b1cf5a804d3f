//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::{MessageState, Role, WorkItem};
use crate::error::DatabaseError;
use crate::fingerprint::Fingerprint;
use crate::reports::{Report, ReportKind};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::workers::{Worker, WorkerEvent, WorkerEventType};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn all_reports(&self) -> Result<HashMap<Uuid, Vec<Report>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REPORT_COLUMNS} FROM reports ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("all_reports: {e}")))?;

        let mut by_message: HashMap<Uuid, Vec<Report>> = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_report(&row) {
                Ok(report) => by_message.entry(report.message_id).or_default().push(report),
                Err(e) => tracing::warn!("Skipping report row: {e}"),
            }
        }
        Ok(by_message)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, DatabaseError> {
    value.map(to_json).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(
    s: Option<String>,
    field: &str,
) -> Result<Option<T>, DatabaseError> {
    s.filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
        })
        .transpose()
}

/// Read a required text column.
fn text(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

const WORKER_COLUMNS: &str =
    "id, api_key, name, in_compliance_check, next_compliance_check, failed_checks, created_at";

const EVENT_COLUMNS: &str = "id, worker_id, time, event_type, worker_config";

const MESSAGE_COLUMNS: &str = "id, conversation_id, parent_id, role, content, error, state, work_parameters, fingerprint, worker_id, handled_by, worker_config, attempts, score, created_at, work_begin_at, work_end_at, excluded_workers";

const REPORT_COLUMNS: &str = "id, message_id, report_type, reason, created_at";

fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let api_key: String = text(row, 1, "worker.api_key")?;
    let created: String = text(row, 6, "worker.created_at")?;
    let in_check: i64 = row.get(3).unwrap_or(0);
    let failed: i64 = row.get(5).unwrap_or(0);

    Ok(Worker {
        id: text(row, 0, "worker.id")?,
        api_key: SecretString::from(api_key),
        name: text(row, 2, "worker.name")?,
        in_compliance_check: in_check != 0,
        next_compliance_check: parse_optional_datetime(row.get(4).ok()),
        failed_checks: u32::try_from(failed).unwrap_or(0),
        created_at: parse_datetime(&created),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<WorkerEvent, DatabaseError> {
    let id: String = text(row, 0, "event.id")?;
    let time: String = text(row, 2, "event.time")?;
    let event_type: String = text(row, 3, "event.event_type")?;

    Ok(WorkerEvent {
        id: parse_uuid(&id, "event.id")?,
        worker_id: text(row, 1, "event.worker_id")?,
        time: parse_datetime(&time),
        event_type: event_type
            .parse::<WorkerEventType>()
            .map_err(DatabaseError::Serialization)?,
        worker_config: from_json(row.get(4).ok(), "event.worker_config")?,
    })
}

/// Map a row to a WorkItem. Reports are attached by the caller; the
/// transition history is not persisted.
fn row_to_item(row: &libsql::Row) -> Result<WorkItem, DatabaseError> {
    let id: String = text(row, 0, "message.id")?;
    let conversation_id: String = text(row, 1, "message.conversation_id")?;
    let parent_id: Option<String> = row.get(2).ok();
    let role: String = text(row, 3, "message.role")?;
    let state: String = text(row, 6, "message.state")?;
    let fingerprint: Option<String> = row.get(8).ok();
    let attempts: i64 = row.get(12).unwrap_or(0);
    let created: String = text(row, 14, "message.created_at")?;

    Ok(WorkItem {
        id: parse_uuid(&id, "message.id")?,
        conversation_id: parse_uuid(&conversation_id, "message.conversation_id")?,
        parent_id: parent_id
            .filter(|s| !s.is_empty())
            .map(|s| parse_uuid(&s, "message.parent_id"))
            .transpose()?,
        role: role.parse::<Role>().map_err(DatabaseError::Serialization)?,
        content: row.get(4).ok(),
        error: row.get(5).ok(),
        state: state
            .parse::<MessageState>()
            .map_err(DatabaseError::Serialization)?,
        work_parameters: from_json(row.get(7).ok(), "message.work_parameters")?,
        fingerprint: fingerprint.filter(|s| !s.is_empty()).map(Fingerprint::from_hex),
        worker_id: row.get(9).ok(),
        handled_by: row.get(10).ok(),
        worker_config: from_json(row.get(11).ok(), "message.worker_config")?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        created_at: parse_datetime(&created),
        work_begin_at: parse_optional_datetime(row.get(15).ok()),
        work_end_at: parse_optional_datetime(row.get(16).ok()),
        excluded_workers: from_json(row.get(17).ok(), "message.excluded_workers")?
            .unwrap_or_default(),
        score: row.get(13).unwrap_or(0),
        reports: Vec::new(),
        transitions: Vec::new(),
    })
}

fn row_to_report(row: &libsql::Row) -> Result<Report, DatabaseError> {
    let id: String = text(row, 0, "report.id")?;
    let message_id: String = text(row, 1, "report.message_id")?;
    let kind: String = text(row, 2, "report.report_type")?;
    let created: String = text(row, 4, "report.created_at")?;

    Ok(Report {
        id: parse_uuid(&id, "report.id")?,
        message_id: parse_uuid(&message_id, "report.message_id")?,
        kind: kind.parse::<ReportKind>().map_err(DatabaseError::Serialization)?,
        reason: row.get(3).unwrap_or_default(),
        created_at: parse_datetime(&created),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn upsert_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO workers (id, api_key, name, in_compliance_check, next_compliance_check, failed_checks, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    in_compliance_check = excluded.in_compliance_check,
                    next_compliance_check = excluded.next_compliance_check,
                    failed_checks = excluded.failed_checks",
                params![
                    worker.id.as_str(),
                    worker.api_key.expose_secret(),
                    worker.name.as_str(),
                    worker.in_compliance_check as i64,
                    worker.next_compliance_check.map(|d| d.to_rfc3339()),
                    worker.failed_checks as i64,
                    worker.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_worker: {e}")))?;

        debug!(worker_id = %worker.id, "Worker saved");
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_worker(&row) {
                Ok(worker) => workers.push(worker),
                Err(e) => tracing::warn!("Skipping worker row: {e}"),
            }
        }
        Ok(workers)
    }

    async fn insert_worker_event(&self, event: &WorkerEvent) -> Result<(), DatabaseError> {
        let config = opt_json(event.worker_config.as_ref())?;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO worker_events (id, worker_id, time, event_type, worker_config) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id.to_string(),
                    event.worker_id.as_str(),
                    event.time.to_rfc3339(),
                    event.event_type.as_str(),
                    config,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_worker_event: {e}")))?;
        Ok(())
    }

    async fn list_worker_events(&self) -> Result<Vec<WorkerEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM worker_events ORDER BY time ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_worker_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_event(&row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping worker event row: {e}"),
            }
        }
        Ok(events)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn upsert_message(&self, item: &WorkItem) -> Result<(), DatabaseError> {
        let work_parameters = opt_json(item.work_parameters.as_ref())?;
        let worker_config = opt_json(item.worker_config.as_ref())?;
        let excluded_workers = to_json(&item.excluded_workers)?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                     ON CONFLICT(id) DO UPDATE SET
                        content = excluded.content,
                        error = excluded.error,
                        state = excluded.state,
                        worker_id = excluded.worker_id,
                        handled_by = excluded.handled_by,
                        worker_config = excluded.worker_config,
                        attempts = excluded.attempts,
                        score = excluded.score,
                        work_begin_at = excluded.work_begin_at,
                        work_end_at = excluded.work_end_at,
                        excluded_workers = excluded.excluded_workers"
                ),
                params![
                    item.id.to_string(),
                    item.conversation_id.to_string(),
                    item.parent_id.map(|id| id.to_string()),
                    item.role.as_str(),
                    item.content.as_deref(),
                    item.error.as_deref(),
                    item.state.as_str(),
                    work_parameters,
                    item.fingerprint.as_ref().map(|f| f.as_str().to_string()),
                    item.worker_id.as_deref(),
                    item.handled_by.as_deref(),
                    worker_config,
                    item.attempts as i64,
                    item.score,
                    item.created_at.to_rfc3339(),
                    item.work_begin_at.map(|d| d.to_rfc3339()),
                    item.work_end_at.map(|d| d.to_rfc3339()),
                    excluded_workers,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_message: {e}")))?;

        debug!(item_id = %item.id, state = %item.state, "Message saved");
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        let mut item = match rows.next().await {
            Ok(Some(row)) => row_to_item(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_message row: {e}"))),
        };
        item.reports = self.list_reports(id).await?;
        Ok(Some(item))
    }

    async fn list_messages(&self) -> Result<Vec<WorkItem>, DatabaseError> {
        let mut reports = self.all_reports().await?;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_item(&row) {
                Ok(mut item) => {
                    item.reports = reports.remove(&item.id).unwrap_or_default();
                    items.push(item);
                }
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(items)
    }

    // ── Reports ─────────────────────────────────────────────────────

    async fn insert_report(&self, report: &Report) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO reports ({REPORT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    report.id.to_string(),
                    report.message_id.to_string(),
                    report.kind.as_str(),
                    report.reason.as_str(),
                    report.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_report: {e}")))?;

        debug!(report_id = %report.id, message_id = %report.message_id, "Report saved");
        Ok(())
    }

    async fn list_reports(&self, message_id: Uuid) -> Result<Vec<Report>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports WHERE message_id = ?1 ORDER BY created_at ASC"
                ),
                params![message_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_reports: {e}")))?;

        let mut reports = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            reports.push(row_to_report(&row)?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{ModelConfig, SamplingParameters, WorkParameters, WorkerConfig};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn model() -> ModelConfig {
        ModelConfig {
            model_id: "llama".into(),
            max_input_length: 1024,
            max_total_length: 2048,
        }
    }

    fn make_item() -> WorkItem {
        WorkItem::pending(
            Uuid::new_v4(),
            None,
            Role::Assistant,
            WorkParameters {
                model: model(),
                plugins: vec!["search".into()],
                sampling: SamplingParameters {
                    temperature: Some(0.7),
                    ..SamplingParameters::default()
                },
                seed: Some(42),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn worker_upsert_and_list() {
        let db = test_db().await;
        let mut worker = Worker::new("w1", "Worker One");
        db.upsert_worker(&worker).await.unwrap();

        worker.in_compliance_check = true;
        worker.failed_checks = 2;
        worker.next_compliance_check = Some(Utc::now());
        db.upsert_worker(&worker).await.unwrap();

        let workers = db.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        let loaded = &workers[0];
        assert_eq!(loaded.id, "w1");
        assert_eq!(loaded.api_key.expose_secret(), worker.api_key.expose_secret());
        assert!(loaded.in_compliance_check);
        assert_eq!(loaded.failed_checks, 2);
        assert!(loaded.next_compliance_check.is_some());
    }

    #[tokio::test]
    async fn worker_events_roundtrip_config() {
        let db = test_db().await;
        db.upsert_worker(&Worker::new("w1", "W")).await.unwrap();
        let config = WorkerConfig {
            model: model(),
            plugins: vec![],
            max_parallel_requests: 1,
        };
        let connect = WorkerEvent::new("w1", WorkerEventType::Connect, Some(config.clone()), Utc::now());
        let disconnect = WorkerEvent::new(
            "w1",
            WorkerEventType::Disconnect,
            None,
            Utc::now() + chrono::Duration::seconds(1),
        );
        db.insert_worker_event(&connect).await.unwrap();
        db.insert_worker_event(&disconnect).await.unwrap();
        // appends are idempotent per event id
        db.insert_worker_event(&connect).await.unwrap();

        let events = db.list_worker_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, WorkerEventType::Connect);
        assert_eq!(events[0].worker_config.as_ref(), Some(&config));
        assert_eq!(events[1].event_type, WorkerEventType::Disconnect);
        assert!(events[1].worker_config.is_none());
    }

    #[tokio::test]
    async fn message_upsert_tracks_state() {
        let db = test_db().await;
        let mut item = make_item();
        db.upsert_message(&item).await.unwrap();

        let now = Utc::now();
        item.assign("w1", None, now).unwrap();
        item.progress("w1", None, now).unwrap();
        item.complete("w1", "Hello".into(), now).unwrap();
        db.upsert_message(&item).await.unwrap();

        let loaded = db.get_message(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, MessageState::Complete);
        assert_eq!(loaded.content.as_deref(), Some("Hello"));
        assert_eq!(loaded.handled_by.as_deref(), Some("w1"));
        assert!(loaded.worker_id.is_none());
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.fingerprint, item.fingerprint);
        assert_eq!(loaded.work_parameters, item.work_parameters);
    }

    #[tokio::test]
    async fn requeued_message_keeps_excluded_workers() {
        let db = test_db().await;
        let mut item = make_item();
        let now = Utc::now();
        item.assign("w1", None, now).unwrap();
        item.requeue("sla timeout", now).unwrap();
        db.upsert_message(&item).await.unwrap();

        let loaded = db.get_message(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, MessageState::Pending);
        assert_eq!(loaded.excluded_workers, vec!["w1".to_string()]);
        assert!(loaded.excludes("w1"));
    }

    #[tokio::test]
    async fn get_message_not_found() {
        let db = test_db().await;
        assert!(db.get_message(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reports_attach_to_messages() {
        let db = test_db().await;
        let item = make_item();
        let other = make_item();
        db.upsert_message(&item).await.unwrap();
        db.upsert_message(&other).await.unwrap();

        let report = Report::new(item.id, ReportKind::Offensive, "rude");
        db.insert_report(&report).await.unwrap();

        assert_eq!(db.list_reports(item.id).await.unwrap(), vec![report.clone()]);
        let all = db.list_messages().await.unwrap();
        assert_eq!(all.len(), 2);
        let loaded = all.iter().find(|i| i.id == item.id).unwrap();
        assert_eq!(loaded.reports.len(), 1);
        assert_eq!(loaded.reports[0].kind, ReportKind::Offensive);
        assert!(all.iter().find(|i| i.id == other.id).unwrap().reports.is_empty());
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dispatch.db");
        let item = make_item();
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_message(&item).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_message(item.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        db.init_schema().await.unwrap();
    }
}
