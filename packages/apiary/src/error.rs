//! Typed errors for the scheduler core.
//!
//! The split mirrors how failures are handled:
//! - [`ValidationError`] — caller bugs, surfaced synchronously, no state change.
//! - [`CommitError`] — a transaction gave up after exhausting its commit
//!   attempts; callers either retry, return a soft failure, or leave the
//!   record for cron to reconcile.
//! - [`SchedulerError`] — umbrella over the above plus storage backend
//!   failures, returned by every public scheduler operation.
//!
//! Soft outcomes (a stale reap race, a refused update, cancel on a running
//! task) are **not** errors: they come back as `None`/`false` values with a
//! structured log, so transient contention never looks like a fault.

use thiserror::Error;

use crate::keys::TaskId;

/// Caller-supplied input was invalid. Nothing was persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("priority ({0}) must be between 0 and 255 (inclusive)")]
    PriorityOutOfRange(i64),

    #[error("expiration_ts must be strictly after created_ts")]
    ExpirationBeforeCreation,

    #[error("task has no commands")]
    NoCommands,

    #[error("cost_usd must be null or non-negative, got {0}")]
    NegativeCost(f64),

    #[error("malformed packed id {0:?}")]
    MalformedPackedId(String),

    #[error("unknown parent task {0}")]
    UnknownParentTask(String),

    #[error("output chunk at offset {offset} disagrees with previously stored bytes")]
    OutputMismatch { offset: usize },

    #[error("command index {0} out of range")]
    CommandIndexOutOfRange(usize),
}

/// A transaction exhausted its commit attempts on revision conflicts.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("transaction on task {task_id} gave up after {attempts} commit attempts")]
pub struct CommitError {
    pub task_id: TaskId,
    pub attempts: u32,
}

/// Top-level error type returned by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("storage backend error: {0}")]
    Store(#[source] anyhow::Error),
}
