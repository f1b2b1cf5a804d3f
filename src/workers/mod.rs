//! Worker records, connection events, registry and compliance gating.
//!
//! - `registry`: connected workers, fingerprints, active assignment per worker
//! - `compliance`: periodic and report-triggered re-verification

pub mod compliance;
pub mod registry;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::WorkerConfig;

pub use compliance::{ComplianceMonitor, ComplianceProbe, spawn_compliance_task};
pub use registry::{RegisteredWorker, WorkerRegistry};

/// A registered remote inference worker. Never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    /// Credential issued on first registration.
    #[serde(skip_serializing)]
    pub api_key: SecretString,
    pub name: String,
    pub in_compliance_check: bool,
    pub next_compliance_check: Option<DateTime<Utc>>,
    /// Consecutive failed compliance checks; drives retry backoff.
    pub failed_checks: u32,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_key: SecretString::from(Uuid::new_v4().to_string()),
            name: name.into(),
            in_compliance_check: false,
            next_compliance_check: None,
            failed_checks: 0,
            created_at: Utc::now(),
        }
    }
}

/// Kind of worker lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerEventType {
    Connect,
    Disconnect,
}

impl WorkerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        }
    }
}

impl std::str::FromStr for WorkerEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!("unknown worker event type: {other}")),
        }
    }
}

/// Append-only record of a worker connecting or disconnecting, with the
/// configuration that was in force at that moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub id: Uuid,
    pub worker_id: String,
    pub time: DateTime<Utc>,
    pub event_type: WorkerEventType,
    pub worker_config: Option<WorkerConfig>,
}

impl WorkerEvent {
    pub fn new(
        worker_id: impl Into<String>,
        event_type: WorkerEventType,
        worker_config: Option<WorkerConfig>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.into(),
            time,
            event_type,
            worker_config,
        }
    }
}
