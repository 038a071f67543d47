//! Storage contract for task entity groups.
//!
//! # The Contract
//!
//! 1. **Snapshot before decide.** Every mutation loads a consistent snapshot
//!    of the task's entity group (request, to-run, summary, run results)
//!    together with its [`Revision`].
//!
//! 2. **Decide is pure.** The decision closure runs synchronously over the
//!    snapshot; no I/O happens between read and write.
//!
//! 3. **Commit checks the revision.** A concurrent writer to the same group
//!    surfaces [`StoreError::Conflict`]; [`transaction`] re-runs the
//!    decision against a fresh snapshot, up to the caller's retry budget,
//!    and reports [`CommitError`] when exhausted.
//!
//! Entity groups are partitioned by shard (see
//! [`TaskId::shard`](crate::keys::TaskId::shard)): adapters may serialize
//! commits per shard rather than per task, which is what makes a low
//! sharding level a deliberate contention generator on canary.
//!
//! Cross-group queries (`dedupe_candidate`, `dispatch_page`, ...) are
//! eventually consistent hints; anything read through them is re-validated
//! transactionally before it is acted on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CommitError;
use crate::keys::{RunResultKey, TaskId};
use crate::request::{PropertiesHash, TaskRequest};
use crate::result::{TaskResultSummary, TaskRunResult};
use crate::to_run::{QueueNumber, TaskToRun};

/// Errors from the storage backend.
///
/// The distinction matters:
/// - [`StoreError::Conflict`] is expected under concurrency; the transaction
///   layer retries or reports a soft failure.
/// - [`StoreError::Backend`] is a system-level failure and propagates.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer committed to the entity group since the snapshot.
    #[error("revision conflict: entity group was modified concurrently")]
    Conflict,

    /// Storage failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

/// Revision of an entity group, for optimistic concurrency control.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(u64);

impl Revision {
    /// A group that has never been written.
    pub const NONE: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// An entity to write within a group commit.
#[derive(Debug, Clone)]
pub enum TaskEntity {
    ToRun(TaskToRun),
    RunResult(TaskRunResult),
    Summary(TaskResultSummary),
}

/// Consistent view of one task's entity group.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub revision: Revision,
    pub request: Option<TaskRequest>,
    pub to_run: Option<TaskToRun>,
    pub summary: Option<TaskResultSummary>,
    /// Ordered by try number.
    pub run_results: Vec<TaskRunResult>,
}

impl GroupSnapshot {
    pub fn run_result(&self, try_number: u8) -> Option<&TaskRunResult> {
        self.run_results
            .iter()
            .find(|run| run.try_number == try_number)
    }
}

/// Storage capability consumed by the scheduler.
///
/// Implementations must document which ordering their raw keys honor: the
/// dedupe query relies on ascending key order being newest-first (see the
/// `keys` module docs).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a freshly validated, immutable request, creating its entity
    /// group. The task is not yet live: the summary and to-run marker
    /// follow through [`TaskStore::commit`].
    async fn insert_request(&self, request: TaskRequest) -> Result<(), StoreError>;

    /// Consistent read of the whole entity group.
    async fn snapshot(&self, task_id: TaskId) -> Result<GroupSnapshot, StoreError>;

    /// Atomically write entities into the group iff its revision still
    /// matches `expected`.
    async fn commit(
        &self,
        task_id: TaskId,
        expected: Revision,
        puts: Vec<TaskEntity>,
    ) -> Result<Revision, StoreError>;

    /// Newest summary advertising `properties_hash`, if any.
    ///
    /// Eventually consistent; ordered by ascending raw key (newest first).
    async fn dedupe_candidate(
        &self,
        properties_hash: &PropertiesHash,
    ) -> Result<Option<TaskResultSummary>, StoreError>;

    /// Page of dispatchable to-runs in ascending queue-number order,
    /// strictly after `after`. Entries always carry a queue number.
    async fn dispatch_page(
        &self,
        after: Option<(QueueNumber, TaskId)>,
        limit: usize,
    ) -> Result<Vec<(TaskRequest, TaskToRun)>, StoreError>;

    /// Page of to-runs still queued but past their expiration.
    async fn expired_page(
        &self,
        now: DateTime<Utc>,
        after: Option<(QueueNumber, TaskId)>,
        limit: usize,
    ) -> Result<Vec<(TaskRequest, TaskToRun)>, StoreError>;

    /// Run results still Running whose last update is at or before `cutoff`.
    async fn stale_running(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<RunResultKey>, StoreError>;
}

/// What a transaction decision wants done.
pub enum TxnOutcome<T> {
    /// Commit `puts` to the group and return `value`.
    Commit { value: T, puts: Vec<TaskEntity> },
    /// Nothing to write; return `value` without committing.
    ReadOnly(T),
}

/// Run `decide` over a fresh snapshot of the group, committing its puts with
/// the snapshot's revision. On [`StoreError::Conflict`], `decide` is re-run
/// up to `retries` more times; when the budget is exhausted the caller gets
/// [`CommitError`]. `retries = 0` is the fail-fast mode used by reap, where
/// losing the race simply means another bot won.
pub async fn transaction<T, F>(
    store: &dyn TaskStore,
    task_id: TaskId,
    retries: u32,
    mut decide: F,
) -> Result<T, TransactionError>
where
    F: FnMut(&GroupSnapshot) -> TxnOutcome<T>,
{
    let attempts = retries.saturating_add(1);
    for _ in 0..attempts {
        let snapshot = store.snapshot(task_id).await.map_err(backend_only)?;
        match decide(&snapshot) {
            TxnOutcome::ReadOnly(value) => return Ok(value),
            TxnOutcome::Commit { value, puts } => {
                match store.commit(task_id, snapshot.revision, puts).await {
                    Ok(_) => return Ok(value),
                    Err(StoreError::Conflict) => continue,
                    Err(err @ StoreError::Backend(_)) => {
                        return Err(backend_only(err));
                    }
                }
            }
        }
    }
    Err(TransactionError::Commit(CommitError { task_id, attempts }))
}

/// Failure modes of [`transaction`].
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl TransactionError {
    /// Lift a store failure from outside the commit path. Reads and inserts
    /// cannot legitimately conflict; one doing so is an adapter bug and is
    /// surfaced as a backend failure.
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::Conflict => {
                TransactionError::Backend(anyhow::anyhow!("conflict outside commit"))
            }
            StoreError::Backend(err) => TransactionError::Backend(err),
        }
    }
}

impl From<TransactionError> for crate::error::SchedulerError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Commit(err) => crate::error::SchedulerError::Commit(err),
            TransactionError::Backend(err) => crate::error::SchedulerError::Store(err),
        }
    }
}

fn backend_only(err: StoreError) -> TransactionError {
    TransactionError::from_store(err)
}
