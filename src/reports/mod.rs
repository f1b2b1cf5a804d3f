//! End-user reports and the score aggregator that turns them into
//! compliance signals.

pub mod aggregator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use aggregator::{ReportAggregator, ReportOutcome};

/// Category of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Spam,
    Offensive,
    Feedback,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spam => "spam",
            Self::Offensive => "offensive",
            Self::Feedback => "feedback",
        }
    }
}

impl std::str::FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spam" => Ok(Self::Spam),
            "offensive" => Ok(Self::Offensive),
            "feedback" => Ok(Self::Feedback),
            other => Err(format!("unknown report kind: {other}")),
        }
    }
}

/// An immutable quality/abuse signal attached to one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub id: Uuid,
    pub message_id: Uuid,
    pub kind: ReportKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Report {
    pub fn new(message_id: Uuid, kind: ReportKind, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id,
            kind,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn to_read(&self) -> ReportRead {
        ReportRead {
            id: self.id,
            report_type: self.kind,
            reason: self.reason.clone(),
        }
    }
}

/// Presentation view of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRead {
    pub id: Uuid,
    pub report_type: ReportKind,
    pub reason: String,
}
