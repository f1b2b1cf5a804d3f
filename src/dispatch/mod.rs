//! Work items, the pending queue, assignment and lifecycle.
//!
//! - `state`: item state machine
//! - `item`: work items and read projections
//! - `queue`: shared item store and FIFO pending set
//! - `scheduler`: claims pending items for eligible idle workers
//! - `lifecycle`: worker signals, cancellation, SLA timeouts

pub mod item;
pub mod lifecycle;
pub mod queue;
pub mod scheduler;
pub mod state;

pub use item::{ChatRead, MessageRead, Role, WorkItem};
pub use lifecycle::{
    LifecycleTracker, SignalKind, TimeoutOutcome, WorkerSignal, spawn_timeout_sweep,
};
pub use queue::{ItemEvent, WorkQueue};
pub use scheduler::{Assignment, AssignmentScheduler};
pub use state::{MessageState, StateTransition};
