//! # Apiary
//!
//! Task scheduling core: clients submit task requests, worker bots poll for
//! matching work, and every attempt is tracked through a transactional
//! state machine with cron-driven reconciliation behind it.
//!
//! ## Architecture
//!
//! ```text
//! Client                          Bot
//!   │ schedule_request              │ bot_reap_task ─────────────┐
//!   ▼                               ▼                            │
//! Scheduler ──────────────► DispatchQueue (queue_number order,   │
//!   │                         dimension filter, negative cache)  │
//!   │ group transactions            │                            │
//!   ▼                               ▼                            │
//! TaskStore ◄─────────────── reap / update / kill (bot calls) ◄──┘
//!   ▲
//!   │ expire + dead-bot sweeps
//! Cron reconciler
//! ```
//!
//! Each task owns four co-located records: the immutable [`TaskRequest`],
//! the dispatchable [`TaskToRun`], one [`TaskRunResult`] per attempt, and
//! the client-visible [`TaskResultSummary`]. All four live in one entity
//! group, so every state transition is a revision-checked group commit.
//!
//! ## Key invariants
//!
//! 1. **At most one attempt runs at a time** — reaping is a fail-fast
//!    transaction that nulls the queue number before the run result exists.
//! 2. **Terminal states are stable** — the only re-entry is the explicit
//!    reset to Pending when a dead first attempt is retried.
//! 3. **At most two tries** — a retry happens only when the first attempt's
//!    bot died before the task expired.
//! 4. **Queries are hints** — dispatch and reconciliation scans are
//!    eventually consistent; every action re-validates transactionally.
//! 5. **Side channels are best-effort** — search indexing and statistics
//!    never fail a scheduling operation.

mod config;
mod cron;
mod deps;
mod error;
mod events;
mod index;
mod keys;
mod request;
mod result;
mod scheduler;
mod store;
mod to_run;

// In-memory fakes for tests and embedding services' test suites.
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use config::{Environment, SchedulerConfig, MAXIMUM_SHARDS};
pub use cron::{start as start_reconciler, DeadBotTally, ExpireTally};
pub use deps::{Clock, SchedulerDeps, SystemClock};
pub use error::{CommitError, SchedulerError, ValidationError};
pub use events::{EventSink, NoOpEventSink, TaskEvent};
pub use index::{NoOpSearchIndex, SearchIndex, TaskDocument};
pub use keys::{ResultSummaryKey, RunResultKey, TaskId, ToRunKey};
pub use request::{
    validate_priority, Dimensions, NewTask, PropertiesHash, TaskProperties, TaskRequest,
    MAXIMUM_PRIORITY,
};
pub use result::{TaskResultSummary, TaskRunResult, TaskState};
pub use scheduler::{CancelOutcome, Scheduler, TaskUpdate, UpdateAck};
pub use store::{
    transaction, GroupSnapshot, Revision, StoreError, TaskEntity, TaskStore, TransactionError,
    TxnOutcome,
};
pub use to_run::{DispatchQueue, DispatchScan, QueueNumber, TaskToRun};
