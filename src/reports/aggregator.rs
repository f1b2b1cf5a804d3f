//! Folds reports into item scores and sends workers whose recent output
//! degrades into a compliance check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Report, ReportKind};
use crate::config::{DispatchConfig, ReportWeights};
use crate::dispatch::WorkQueue;
use crate::error::Error;
use crate::workers::ComplianceMonitor;

/// Result of applying one report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub report_id: Uuid,
    pub item_score: i64,
    /// Worker credited with the reported item, if any.
    pub worker_id: Option<String>,
    /// Summed score over that worker's recent window.
    pub worker_score: Option<i64>,
    /// Whether this report sent the worker into a compliance check.
    pub check_scheduled: bool,
}

pub struct ReportAggregator {
    queue: Arc<WorkQueue>,
    monitor: Arc<ComplianceMonitor>,
    weights: ReportWeights,
    window: usize,
    threshold: i64,
}

impl ReportAggregator {
    pub fn new(
        queue: Arc<WorkQueue>,
        monitor: Arc<ComplianceMonitor>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            queue,
            monitor,
            weights: config.report_weights,
            window: config.score_window.max(1),
            threshold: config.score_threshold,
        }
    }

    pub fn weight(&self, kind: ReportKind) -> i64 {
        match kind {
            ReportKind::Spam => self.weights.spam,
            ReportKind::Offensive => self.weights.offensive,
            ReportKind::Feedback => self.weights.feedback,
        }
    }

    pub async fn apply_report(
        &self,
        item_id: Uuid,
        kind: ReportKind,
        reason: impl Into<String>,
    ) -> Result<ReportOutcome, Error> {
        self.apply_report_at(item_id, kind, reason, Utc::now()).await
    }

    /// Attach a report, update the item score, and check the credited
    /// worker's recent window against the threshold.
    ///
    /// The queue write lock is held across the whole step so that concurrent
    /// reports against one worker schedule at most one check.
    pub async fn apply_report_at(
        &self,
        item_id: Uuid,
        kind: ReportKind,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, Error> {
        let report = Report::new(item_id, kind, reason);
        let weight = self.weight(kind);

        let mut queue = self.queue.write().await;
        let item = queue.get_mut(item_id)?;
        let item_score = item.add_report(report.clone(), weight);
        let item = item.clone();

        self.queue.persist_report(&report).await;
        self.queue.commit(&item).await;

        debug!(
            item_id = %item_id,
            kind = kind.as_str(),
            item_score,
            "Report recorded"
        );

        let mut outcome = ReportOutcome {
            report_id: report.id,
            item_score,
            worker_id: None,
            worker_score: None,
            check_scheduled: false,
        };

        let Some(worker_id) = item.handled_by.clone() else {
            return Ok(outcome);
        };

        let worker_score: i64 = queue
            .recent_for_worker(&worker_id, self.window)
            .iter()
            .map(|i| i.score)
            .sum();
        outcome.worker_id = Some(worker_id.clone());
        outcome.worker_score = Some(worker_score);

        if worker_score >= self.threshold {
            return Ok(outcome);
        }

        // queue lock still held: lock order queue -> registry
        match self.monitor.start_check_if_clear(&worker_id, now).await {
            Ok(true) => {
                info!(
                    worker_id = %worker_id,
                    worker_score,
                    threshold = self.threshold,
                    "Worker quality degraded, compliance check scheduled"
                );
                outcome.check_scheduled = true;
            }
            Ok(false) => debug!(worker_id = %worker_id, "Worker already in compliance check"),
            Err(e) => warn!(worker_id = %worker_id, error = %e, "Could not schedule compliance check"),
        }
        drop(queue);

        Ok(outcome)
    }
}
