//! Work items and their read projections.
//!
//! Every mutation of an item's state goes through the guarded methods here;
//! a rejected call returns [`ItemError::InvalidTransition`] and leaves the
//! item untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{MessageState, StateTransition};
use crate::error::{FingerprintError, ItemError};
use crate::fingerprint::{Fingerprint, WorkParameters, WorkerConfig};
use crate::reports::{Report, ReportRead};

/// Transition history kept per item.
const MAX_TRANSITIONS: usize = 50;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A chat message, either awaiting generation or already produced.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub role: Role,
    pub content: Option<String>,
    pub error: Option<String>,
    pub state: MessageState,
    /// `None` for messages recorded with content and never generated.
    pub work_parameters: Option<WorkParameters>,
    pub fingerprint: Option<Fingerprint>,
    /// Worker holding the item; set only while assigned or in progress.
    pub worker_id: Option<String>,
    /// Worker that produced the terminal result. Kept for attribution.
    pub handled_by: Option<String>,
    /// Configuration of the worker at claim time.
    pub worker_config: Option<WorkerConfig>,
    /// Number of claims so far.
    pub attempts: u32,
    /// Workers this item was taken back from. None of them may claim it again.
    pub excluded_workers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub work_begin_at: Option<DateTime<Utc>>,
    pub work_end_at: Option<DateTime<Utc>>,
    pub score: i64,
    pub reports: Vec<Report>,
    pub transitions: Vec<StateTransition>,
}

impl WorkItem {
    /// A new item that needs a generated reply.
    pub fn pending(
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        work_parameters: WorkParameters,
    ) -> Result<Self, FingerprintError> {
        let fingerprint = work_parameters.fingerprint()?;
        let mut item = Self::blank(conversation_id, parent_id, role, MessageState::Pending);
        item.work_parameters = Some(work_parameters);
        item.fingerprint = Some(fingerprint);
        Ok(item)
    }

    /// A message whose content already exists (a human turn, a system prompt).
    pub fn recorded(
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        let mut item = Self::blank(conversation_id, parent_id, role, MessageState::Complete);
        item.content = Some(content.into());
        item.work_end_at = Some(item.created_at);
        item
    }

    fn blank(
        conversation_id: Uuid,
        parent_id: Option<Uuid>,
        role: Role,
        state: MessageState,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            parent_id,
            role,
            content: None,
            error: None,
            state,
            work_parameters: None,
            fingerprint: None,
            worker_id: None,
            handled_by: None,
            worker_config: None,
            attempts: 0,
            excluded_workers: Vec::new(),
            created_at: Utc::now(),
            work_begin_at: None,
            work_end_at: None,
            score: 0,
            reports: Vec::new(),
            transitions: Vec::new(),
        }
    }

    fn reject(&self, signal: impl Into<String>) -> ItemError {
        ItemError::InvalidTransition {
            id: self.id,
            state: self.state.to_string(),
            signal: signal.into(),
        }
    }

    /// Reject signals from anyone but the current holder.
    fn check_holder(&self, worker_id: &str, signal: &str) -> Result<(), ItemError> {
        if self.worker_id.as_deref() != Some(worker_id) {
            return Err(self.reject(format!("{signal} from {worker_id}")));
        }
        Ok(())
    }

    fn transition_to(
        &mut self,
        target: MessageState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ItemError> {
        if !self.state.can_transition_to(target) {
            return Err(self.reject(target.as_str()));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = target;
        Ok(())
    }

    /// `pending → assigned`. Only the scheduler's claim calls this.
    pub fn assign(
        &mut self,
        worker_id: &str,
        worker_config: Option<WorkerConfig>,
        now: DateTime<Utc>,
    ) -> Result<(), ItemError> {
        if self.state != MessageState::Pending || self.excludes(worker_id) {
            return Err(self.reject(format!("assign to {worker_id}")));
        }
        self.transition_to(
            MessageState::Assigned,
            Some(format!("claimed by {worker_id}")),
            now,
        )?;
        self.worker_id = Some(worker_id.to_string());
        self.worker_config = worker_config;
        self.work_begin_at = Some(now);
        self.attempts += 1;
        Ok(())
    }

    /// First (or repeated) progress signal. Returns `true` when the state
    /// changed; duplicates while in progress only refresh partial content.
    pub fn progress(
        &mut self,
        worker_id: &str,
        partial: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool, ItemError> {
        self.check_holder(worker_id, "progress")?;
        let changed = match self.state {
            MessageState::Assigned => {
                self.transition_to(MessageState::InProgress, None, now)?;
                true
            }
            MessageState::InProgress => false,
            _ => return Err(self.reject("progress")),
        };
        if partial.is_some() {
            self.content = partial;
        }
        Ok(changed)
    }

    /// `in_progress → complete`. Returns the worker to release.
    pub fn complete(
        &mut self,
        worker_id: &str,
        content: String,
        now: DateTime<Utc>,
    ) -> Result<String, ItemError> {
        self.check_holder(worker_id, "complete")?;
        if self.state != MessageState::InProgress {
            return Err(self.reject("complete"));
        }
        self.transition_to(MessageState::Complete, None, now)?;
        self.content = Some(content);
        Ok(self.finish(now))
    }

    /// `assigned | in_progress → error`. Returns the worker to release.
    pub fn fail(
        &mut self,
        worker_id: &str,
        detail: String,
        now: DateTime<Utc>,
    ) -> Result<String, ItemError> {
        self.check_holder(worker_id, "error")?;
        self.transition_to(MessageState::Error, Some(detail.clone()), now)?;
        self.content = None;
        self.error = Some(detail);
        Ok(self.finish(now))
    }

    fn finish(&mut self, now: DateTime<Utc>) -> String {
        let worker = self.worker_id.take().unwrap_or_default();
        self.handled_by = Some(worker.clone());
        self.work_end_at = Some(now);
        worker
    }

    /// Return a held item to `pending` so another worker can take it.
    /// Returns the worker that lost it, which is barred from claiming it again.
    pub fn requeue(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<String>, ItemError> {
        self.transition_to(MessageState::Pending, Some(reason.to_string()), now)?;
        self.content = None;
        self.work_begin_at = None;
        let lost = self.worker_id.take();
        if let Some(worker) = &lost {
            if !self.excludes(worker) {
                self.excluded_workers.push(worker.clone());
            }
        }
        Ok(lost)
    }

    /// Whether `worker_id` already lost this item once.
    pub fn excludes(&self, worker_id: &str) -> bool {
        self.excluded_workers.iter().any(|w| w == worker_id)
    }

    /// Finalize as `aborted` from any non-terminal state.
    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<String>, ItemError> {
        self.transition_to(MessageState::Aborted, Some(reason.to_string()), now)?;
        self.content = None;
        self.work_end_at = Some(now);
        Ok(self.worker_id.take())
    }

    /// Held for longer than `sla` without a terminal signal.
    pub fn is_overdue(&self, sla: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.state.holds_worker()
            && self
                .work_begin_at
                .map(|begin| now.signed_duration_since(begin) > sla)
                .unwrap_or(false)
    }

    /// Attach a report and fold its weight into the score.
    pub(crate) fn add_report(&mut self, report: Report, weight: i64) -> i64 {
        self.reports.push(report);
        self.score = self.score.saturating_add(weight);
        self.score
    }

    /// Worker credited with this item, if any.
    pub fn attributed_worker(&self) -> Option<&str> {
        self.handled_by.as_deref().or(self.worker_id.as_deref())
    }

    pub fn to_read(&self) -> MessageRead {
        MessageRead {
            id: self.id,
            parent_id: self.parent_id,
            content: self.content.clone(),
            error: self.error.clone(),
            role: self.role,
            state: self.state,
            score: self.score,
            worker_id: self.attributed_worker().map(str::to_string),
            reports: self.reports.iter().map(Report::to_read).collect(),
        }
    }
}

/// Presentation view of one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRead {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub content: Option<String>,
    pub error: Option<String>,
    pub role: Role,
    pub state: MessageState,
    pub score: i64,
    pub worker_id: Option<String>,
    pub reports: Vec<ReportRead>,
}

/// Presentation view of a conversation, messages in creation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRead {
    pub id: Uuid,
    pub messages: Vec<MessageRead>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{ModelConfig, SamplingParameters};

    fn params() -> WorkParameters {
        WorkParameters {
            model: ModelConfig {
                model_id: "m".into(),
                max_input_length: 10,
                max_total_length: 20,
            },
            plugins: vec![],
            sampling: SamplingParameters::default(),
            seed: None,
        }
    }

    fn item() -> WorkItem {
        WorkItem::pending(Uuid::new_v4(), None, Role::Assistant, params()).unwrap()
    }

    fn assert_invariants(item: &WorkItem) {
        if item.error.is_some() {
            assert_eq!(item.state, MessageState::Error);
        }
        if item.content.is_some() && item.role == Role::Assistant && item.work_parameters.is_some() {
            assert!(matches!(item.state, MessageState::InProgress | MessageState::Complete));
        }
        assert_eq!(item.worker_id.is_some(), item.state.holds_worker());
    }

    #[test]
    fn full_lifecycle() {
        let now = Utc::now();
        let mut it = item();
        assert_eq!(it.state, MessageState::Pending);
        assert!(it.fingerprint.is_some());

        it.assign("w1", None, now).unwrap();
        assert_invariants(&it);
        assert_eq!(it.attempts, 1);
        assert!(it.progress("w1", Some("He".into()), now).unwrap());
        assert!(!it.progress("w1", Some("Hel".into()), now).unwrap());
        assert_eq!(it.content.as_deref(), Some("Hel"));
        assert_invariants(&it);

        let released = it.complete("w1", "Hello".into(), now).unwrap();
        assert_eq!(released, "w1");
        assert_eq!(it.state, MessageState::Complete);
        assert_eq!(it.content.as_deref(), Some("Hello"));
        assert_eq!(it.handled_by.as_deref(), Some("w1"));
        assert!(it.work_end_at.is_some());
        assert_invariants(&it);
        assert_eq!(it.transitions.len(), 3);
    }

    #[test]
    fn complete_before_progress_is_rejected() {
        let mut it = item();
        it.assign("w1", None, Utc::now()).unwrap();
        let err = it.complete("w1", "x".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, ItemError::InvalidTransition { .. }));
        assert_eq!(it.state, MessageState::Assigned);
        assert!(it.content.is_none());
    }

    #[test]
    fn duplicate_terminal_signal_does_not_mutate() {
        let now = Utc::now();
        let mut it = item();
        it.assign("w1", None, now).unwrap();
        it.progress("w1", None, now).unwrap();
        it.complete("w1", "Hello".into(), now).unwrap();

        assert!(it.complete("w1", "Again".into(), now).is_err());
        assert!(it.fail("w1", "boom".into(), now).is_err());
        assert_eq!(it.content.as_deref(), Some("Hello"));
        assert!(it.error.is_none());
        assert_eq!(it.state, MessageState::Complete);
    }

    #[test]
    fn signal_from_other_worker_is_rejected() {
        let now = Utc::now();
        let mut it = item();
        it.assign("w1", None, now).unwrap();
        let err = it.progress("w2", None, now).unwrap_err();
        match err {
            ItemError::InvalidTransition { signal, .. } => assert_eq!(signal, "progress from w2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fail_records_error() {
        let now = Utc::now();
        let mut it = item();
        it.assign("w1", None, now).unwrap();
        it.progress("w1", Some("partial".into()), now).unwrap();
        it.fail("w1", "CUDA out of memory".into(), now).unwrap();
        assert_eq!(it.state, MessageState::Error);
        assert_eq!(it.error.as_deref(), Some("CUDA out of memory"));
        assert!(it.content.is_none());
        assert_invariants(&it);
    }

    #[test]
    fn requeue_clears_holder() {
        let now = Utc::now();
        let mut it = item();
        it.assign("w1", None, now).unwrap();
        it.progress("w1", Some("par".into()), now).unwrap();
        assert_eq!(it.requeue("timeout", now).unwrap().as_deref(), Some("w1"));
        assert_eq!(it.state, MessageState::Pending);
        assert!(it.content.is_none());
        assert!(it.work_begin_at.is_none());
        assert_invariants(&it);

        it.assign("w2", None, now).unwrap();
        assert_eq!(it.attempts, 2);
    }

    #[test]
    fn worker_that_lost_item_cannot_take_it_back() {
        let now = Utc::now();
        let mut it = item();
        it.assign("w1", None, now).unwrap();
        it.requeue("sla timeout", now).unwrap();
        assert!(it.excludes("w1"));

        assert!(matches!(
            it.assign("w1", None, now),
            Err(ItemError::InvalidTransition { .. })
        ));
        assert_eq!(it.state, MessageState::Pending);
        assert_eq!(it.attempts, 1);

        // stale signals from the old holder stay rejected after a new claim
        it.assign("w2", None, now).unwrap();
        assert!(it.progress("w1", None, now).is_err());
        it.progress("w2", None, now).unwrap();
        assert!(it.complete("w1", "stale".into(), now).is_err());
        it.requeue("sla timeout", now).unwrap();
        assert_eq!(it.excluded_workers, vec!["w1".to_string(), "w2".to_string()]);
    }

    #[test]
    fn abort_from_pending_and_terminal() {
        let now = Utc::now();
        let mut it = item();
        assert_eq!(it.abort("cancelled", now).unwrap(), None);
        assert_eq!(it.state, MessageState::Aborted);
        assert!(it.abort("again", now).is_err());
    }

    #[test]
    fn overdue_only_when_held_past_sla() {
        let now = Utc::now();
        let sla = chrono::Duration::seconds(30);
        let mut it = item();
        assert!(!it.is_overdue(sla, now + chrono::Duration::hours(1)));
        it.assign("w1", None, now).unwrap();
        assert!(!it.is_overdue(sla, now + chrono::Duration::seconds(30)));
        assert!(it.is_overdue(sla, now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn recorded_message_is_complete_without_worker() {
        let it = WorkItem::recorded(Uuid::new_v4(), None, Role::User, "hi");
        assert_eq!(it.state, MessageState::Complete);
        assert!(it.worker_id.is_none());
        assert!(it.fingerprint.is_none());
        let read = it.to_read();
        assert_eq!(read.content.as_deref(), Some("hi"));
        assert_eq!(read.role, Role::User);
    }
}
