//! Compliance monitor: decides when a worker must requalify.
//!
//! A worker in an active check is excluded from assignment until a check
//! passes. Checks are placed on a fixed cadence per connected worker, or
//! immediately when the report aggregator sees quality degrade. Failed
//! checks are retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::Worker;
use super::registry::WorkerRegistry;
use crate::config::DispatchConfig;
use crate::error::WorkerError;

/// Performs the actual re-verification of a worker (e.g. a known prompt
/// whose answer is compared against a reference).
#[async_trait]
pub trait ComplianceProbe: Send + Sync {
    async fn verify(&self, worker: &Worker) -> bool;
}

/// Schedules and resolves compliance checks.
pub struct ComplianceMonitor {
    registry: Arc<WorkerRegistry>,
    cadence: Duration,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl ComplianceMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, config: &DispatchConfig) -> Self {
        Self {
            registry,
            cadence: config.compliance_cadence,
            base_backoff: config.compliance_base_backoff,
            max_backoff: config.compliance_max_backoff,
        }
    }

    /// Put the worker into a check due at `at`. Takes effect immediately:
    /// the worker leaves the eligible set before this returns.
    pub async fn schedule_check(
        &self,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Worker, WorkerError> {
        let worker = self
            .registry
            .update_worker(worker_id, |w| {
                w.in_compliance_check = true;
                w.next_compliance_check = Some(at);
            })
            .await?;
        info!(worker_id, at = %at, "Compliance check scheduled");
        Ok(worker)
    }

    /// Start an immediate check unless the worker is already in one.
    /// Returns whether a check was started.
    pub async fn start_check_if_clear(
        &self,
        worker_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, WorkerError> {
        let mut started = false;
        self.registry
            .update_worker(worker_id, |w| {
                if !w.in_compliance_check {
                    w.in_compliance_check = true;
                    w.next_compliance_check = Some(at);
                    started = true;
                }
            })
            .await?;
        if started {
            info!(worker_id, at = %at, "Compliance check scheduled");
        }
        Ok(started)
    }

    pub async fn complete_check(
        &self,
        worker_id: &str,
        passed: bool,
    ) -> Result<Worker, WorkerError> {
        self.complete_check_at(worker_id, passed, Utc::now()).await
    }

    /// Resolve a check. A pass clears the flag and books the next routine
    /// check; a failure keeps the worker excluded and retries after backoff.
    pub async fn complete_check_at(
        &self,
        worker_id: &str,
        passed: bool,
        now: DateTime<Utc>,
    ) -> Result<Worker, WorkerError> {
        let cadence = self.cadence;
        let (base, max) = (self.base_backoff, self.max_backoff);

        let worker = self
            .registry
            .update_worker(worker_id, |w| {
                if passed {
                    w.in_compliance_check = false;
                    w.failed_checks = 0;
                    w.next_compliance_check = Some(now + to_chrono(cadence));
                } else {
                    w.in_compliance_check = true;
                    w.failed_checks = w.failed_checks.saturating_add(1);
                    w.next_compliance_check =
                        Some(now + to_chrono(backoff(base, max, w.failed_checks)));
                }
            })
            .await?;

        if passed {
            info!(worker_id, "Compliance check passed");
        } else {
            warn!(
                worker_id,
                failures = worker.failed_checks,
                retry_at = ?worker.next_compliance_check,
                "Compliance check failed"
            );
        }
        Ok(worker)
    }

    /// Apply the periodic cadence. Connected workers seen for the first time
    /// get their first check booked; workers whose routine check is due are
    /// moved into a check. Returns every worker whose check is due for a
    /// probe now.
    pub async fn run_due_checks(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();

        for worker_id in self.registry.connected_workers().await {
            let worker = match self.registry.get(&worker_id).await {
                Ok(w) => w,
                Err(_) => continue,
            };

            match worker.next_compliance_check {
                None if !worker.in_compliance_check => {
                    let next = now + to_chrono(self.cadence);
                    if let Err(e) = self
                        .registry
                        .update_worker(&worker_id, |w| w.next_compliance_check = Some(next))
                        .await
                    {
                        warn!(worker_id = %worker_id, error = %e, "Failed to book first compliance check");
                    }
                }
                Some(at) if at <= now => {
                    if !worker.in_compliance_check {
                        if let Err(e) = self.schedule_check(&worker_id, at).await {
                            warn!(worker_id = %worker_id, error = %e, "Failed to start routine compliance check");
                            continue;
                        }
                    }
                    due.push(worker_id);
                }
                None => due.push(worker_id),
                Some(_) => {}
            }
        }

        if !due.is_empty() {
            debug!(count = due.len(), "Compliance checks due");
        }
        due
    }

    /// Run one round: start due checks and resolve each through `probe`.
    pub async fn probe_due(&self, probe: &dyn ComplianceProbe, now: DateTime<Utc>) -> usize {
        let due = self.run_due_checks(now).await;
        let mut resolved = 0;
        for worker_id in due {
            let worker = match self.registry.get(&worker_id).await {
                Ok(w) => w,
                Err(_) => continue,
            };
            let passed = probe.verify(&worker).await;
            if self.complete_check_at(&worker_id, passed, now).await.is_ok() {
                resolved += 1;
            }
        }
        resolved
    }
}

/// Delay before retrying after `failures` consecutive failed checks.
fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Spawn a background task that applies the check cadence. With a probe,
/// due checks are also resolved; without one they stay open until
/// [`ComplianceMonitor::complete_check`] is called from outside.
pub fn spawn_compliance_task(
    monitor: Arc<ComplianceMonitor>,
    probe: Option<Arc<dyn ComplianceProbe>>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match probe {
                Some(ref probe) => {
                    monitor.probe_due(probe.as_ref(), Utc::now()).await;
                }
                None => {
                    monitor.run_due_checks(Utc::now()).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{ModelConfig, WorkerConfig};

    fn config() -> WorkerConfig {
        WorkerConfig {
            model: ModelConfig {
                model_id: "m".into(),
                max_input_length: 10,
                max_total_length: 20,
            },
            plugins: vec![],
            max_parallel_requests: 1,
        }
    }

    async fn setup() -> (Arc<WorkerRegistry>, ComplianceMonitor) {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("w1", "W1", config(), None).await.unwrap();
        let monitor = ComplianceMonitor::new(Arc::clone(&registry), &DispatchConfig::default());
        (registry, monitor)
    }

    struct FixedProbe(bool);

    #[async_trait]
    impl ComplianceProbe for FixedProbe {
        async fn verify(&self, _worker: &Worker) -> bool {
            self.0
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(300);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(60));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(120));
        assert_eq!(backoff(base, max, 3), Duration::from_secs(240));
        assert_eq!(backoff(base, max, 4), max);
        assert_eq!(backoff(base, max, 40), max);
    }

    #[tokio::test]
    async fn schedule_check_excludes_worker_immediately() {
        let (registry, monitor) = setup().await;
        let fp = config().fingerprint().unwrap();
        assert_eq!(registry.eligible_workers(&fp).await, vec!["w1"]);

        let worker = monitor.schedule_check("w1", Utc::now()).await.unwrap();
        assert!(worker.in_compliance_check);
        assert!(registry.eligible_workers(&fp).await.is_empty());
    }

    #[tokio::test]
    async fn start_check_if_clear_fires_once() {
        let (_registry, monitor) = setup().await;
        let now = Utc::now();
        assert!(monitor.start_check_if_clear("w1", now).await.unwrap());
        assert!(!monitor.start_check_if_clear("w1", now).await.unwrap());
    }

    #[tokio::test]
    async fn passed_check_restores_eligibility() {
        let (registry, monitor) = setup().await;
        let fp = config().fingerprint().unwrap();
        let now = Utc::now();
        monitor.schedule_check("w1", now).await.unwrap();
        let worker = monitor.complete_check_at("w1", true, now).await.unwrap();

        assert!(!worker.in_compliance_check);
        assert_eq!(
            worker.next_compliance_check,
            Some(now + to_chrono(DispatchConfig::default().compliance_cadence))
        );
        assert_eq!(registry.eligible_workers(&fp).await, vec!["w1"]);
    }

    #[tokio::test]
    async fn failed_check_backs_off() {
        let (registry, monitor) = setup().await;
        let fp = config().fingerprint().unwrap();
        let now = Utc::now();
        monitor.schedule_check("w1", now).await.unwrap();

        let first = monitor.complete_check_at("w1", false, now).await.unwrap();
        let second = monitor.complete_check_at("w1", false, now).await.unwrap();
        assert!(second.in_compliance_check);
        assert_eq!(second.failed_checks, 2);
        assert!(second.next_compliance_check > first.next_compliance_check);
        assert!(registry.eligible_workers(&fp).await.is_empty());
    }

    #[tokio::test]
    async fn cadence_books_then_triggers_checks() {
        let (registry, monitor) = setup().await;
        let now = Utc::now();

        assert!(monitor.run_due_checks(now).await.is_empty());
        let booked = registry.get("w1").await.unwrap().next_compliance_check.unwrap();
        assert!(booked > now);
        assert!(!registry.get("w1").await.unwrap().in_compliance_check);

        let due = monitor.run_due_checks(booked).await;
        assert_eq!(due, vec!["w1"]);
        assert!(registry.get("w1").await.unwrap().in_compliance_check);
    }

    #[tokio::test]
    async fn probe_resolves_due_checks() {
        let (registry, monitor) = setup().await;
        let now = Utc::now();
        monitor.schedule_check("w1", now).await.unwrap();

        let resolved = monitor.probe_due(&FixedProbe(true), now).await;
        assert_eq!(resolved, 1);
        assert!(!registry.get("w1").await.unwrap().in_compliance_check);

        monitor.schedule_check("w1", now).await.unwrap();
        monitor.probe_due(&FixedProbe(false), now).await;
        assert!(registry.get("w1").await.unwrap().in_compliance_check);
    }

    #[tokio::test]
    async fn background_task_applies_cadence_without_probe() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register("w1", "W1", config(), None).await.unwrap();
        let monitor = Arc::new(ComplianceMonitor::new(
            Arc::clone(&registry),
            &DispatchConfig {
                compliance_cadence: Duration::from_millis(1),
                ..DispatchConfig::default()
            },
        ));

        let handle = spawn_compliance_task(Arc::clone(&monitor), None, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let worker = registry.get("w1").await.unwrap();
        assert!(worker.in_compliance_check);
        assert!(worker.next_compliance_check.is_some());
        // no probe, so the check stays open
        assert_eq!(worker.failed_checks, 0);
    }

    #[tokio::test]
    async fn unknown_worker_errors() {
        let (_registry, monitor) = setup().await;
        assert!(monitor.schedule_check("nope", Utc::now()).await.is_err());
        assert!(monitor.complete_check("nope", true).await.is_err());
    }
}
