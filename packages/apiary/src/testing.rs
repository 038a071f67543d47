//! In-memory fakes for every collaborator the scheduler consumes.
//!
//! Nothing here talks to the network: tests drive full scheduling
//! lifecycles against [`InMemoryTaskStore`], move time with [`FakeClock`],
//! and assert on what [`RecordingEvents`] and [`RecordingIndex`] captured.
//! Failure injection on the store exercises the conflict and backend error
//! paths without a real database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::config::{Environment, SchedulerConfig};
use crate::deps::{Clock, SchedulerDeps};
use crate::events::{EventSink, TaskEvent};
use crate::index::{SearchIndex, TaskDocument};
use crate::keys::{RunResultKey, TaskId};
use crate::request::{PropertiesHash, TaskRequest};
use crate::result::{TaskResultSummary, TaskRunResult, TaskState};
use crate::scheduler::Scheduler;
use crate::store::{GroupSnapshot, Revision, StoreError, TaskEntity, TaskStore};
use crate::to_run::{QueueNumber, TaskToRun};

// =============================================================================
// In-memory store
// =============================================================================

struct Group {
    request: TaskRequest,
    to_run: Option<TaskToRun>,
    summary: Option<TaskResultSummary>,
    run_results: BTreeMap<u8, TaskRunResult>,
}

#[derive(Default)]
struct Inner {
    groups: HashMap<TaskId, Group>,
    shard_revisions: HashMap<String, Revision>,
}

/// HashMap-backed [`TaskStore`] with the same revision discipline as a real
/// adapter.
///
/// Revisions are tracked per *shard*, not per task: any commit in a shard
/// invalidates concurrent transactions on every task in it, which is
/// exactly the contention a low canary sharding level is meant to produce.
///
/// Raw-key ordering: queries sort by the raw task id, which by allocation
/// is newest-first (see the `keys` module). `dedupe_candidate` relies on
/// this.
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
    sharding_level: u8,
    conflicts_to_inject: Mutex<u32>,
    backend_failures_to_inject: Mutex<u32>,
}

impl InMemoryTaskStore {
    pub fn new(sharding_level: u8) -> Self {
        InMemoryTaskStore {
            inner: Mutex::new(Inner::default()),
            sharding_level,
            conflicts_to_inject: Mutex::new(0),
            backend_failures_to_inject: Mutex::new(0),
        }
    }

    /// Make the next `count` commits fail with a revision conflict.
    pub fn inject_conflicts(&self, count: u32) {
        *self.conflicts_to_inject.lock().expect("mutex poisoned") = count;
    }

    /// Make the next `count` commits fail as backend errors.
    pub fn inject_backend_failures(&self, count: u32) {
        *self.backend_failures_to_inject.lock().expect("mutex poisoned") = count;
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {e}")))
    }

    fn take_injected(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock().expect("mutex poisoned");
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_request(&self, request: TaskRequest) -> Result<(), StoreError> {
        let shard = request.id.shard(self.sharding_level);
        let mut inner = self.lock()?;
        if inner.groups.contains_key(&request.id) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "task {} already exists",
                request.id
            )));
        }
        inner.groups.insert(
            request.id,
            Group {
                request,
                to_run: None,
                summary: None,
                run_results: BTreeMap::new(),
            },
        );
        let revision = inner.shard_revisions.entry(shard).or_insert(Revision::NONE);
        *revision = revision.next();
        Ok(())
    }

    async fn snapshot(&self, task_id: TaskId) -> Result<GroupSnapshot, StoreError> {
        let shard = task_id.shard(self.sharding_level);
        let inner = self.lock()?;
        let revision = inner
            .shard_revisions
            .get(&shard)
            .copied()
            .unwrap_or(Revision::NONE);
        let Some(group) = inner.groups.get(&task_id) else {
            return Ok(GroupSnapshot {
                revision,
                request: None,
                to_run: None,
                summary: None,
                run_results: Vec::new(),
            });
        };
        Ok(GroupSnapshot {
            revision,
            request: Some(group.request.clone()),
            to_run: group.to_run.clone(),
            summary: group.summary.clone(),
            run_results: group.run_results.values().cloned().collect(),
        })
    }

    async fn commit(
        &self,
        task_id: TaskId,
        expected: Revision,
        puts: Vec<TaskEntity>,
    ) -> Result<Revision, StoreError> {
        if Self::take_injected(&self.backend_failures_to_inject) {
            return Err(StoreError::Backend(anyhow::anyhow!("injected failure")));
        }
        if Self::take_injected(&self.conflicts_to_inject) {
            return Err(StoreError::Conflict);
        }
        let shard = task_id.shard(self.sharding_level);
        let mut inner = self.lock()?;
        let current = inner
            .shard_revisions
            .get(&shard)
            .copied()
            .unwrap_or(Revision::NONE);
        if current != expected {
            return Err(StoreError::Conflict);
        }
        let group = inner.groups.get_mut(&task_id).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("unknown task {task_id}"))
        })?;
        for put in puts {
            match put {
                TaskEntity::ToRun(to_run) => group.to_run = Some(to_run),
                TaskEntity::Summary(summary) => group.summary = Some(summary),
                TaskEntity::RunResult(run_result) => {
                    group.run_results.insert(run_result.try_number, run_result);
                }
            }
        }
        let next = current.next();
        inner.shard_revisions.insert(shard, next);
        Ok(next)
    }

    async fn dedupe_candidate(
        &self,
        properties_hash: &PropertiesHash,
    ) -> Result<Option<TaskResultSummary>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .groups
            .iter()
            .filter_map(|(_, group)| group.summary.as_ref())
            .filter(|summary| summary.properties_hash.as_ref() == Some(properties_hash))
            // Ascending raw key is newest first, by id allocation.
            .min_by_key(|summary| summary.key.task_id().raw())
            .cloned())
    }

    async fn dispatch_page(
        &self,
        after: Option<(QueueNumber, TaskId)>,
        limit: usize,
    ) -> Result<Vec<(TaskRequest, TaskToRun)>, StoreError> {
        let inner = self.lock()?;
        let mut entries: Vec<(TaskRequest, TaskToRun)> = inner
            .groups
            .values()
            .filter_map(|group| {
                let to_run = group.to_run.clone()?;
                to_run.queue_number?;
                Some((group.request.clone(), to_run))
            })
            .collect();
        sort_and_trim(&mut entries, after, limit);
        Ok(entries)
    }

    async fn expired_page(
        &self,
        now: DateTime<Utc>,
        after: Option<(QueueNumber, TaskId)>,
        limit: usize,
    ) -> Result<Vec<(TaskRequest, TaskToRun)>, StoreError> {
        let inner = self.lock()?;
        let mut entries: Vec<(TaskRequest, TaskToRun)> = inner
            .groups
            .values()
            .filter_map(|group| {
                let to_run = group.to_run.clone()?;
                to_run.queue_number?;
                (to_run.expiration_ts <= now)
                    .then(|| (group.request.clone(), to_run))
            })
            .collect();
        sort_and_trim(&mut entries, after, limit);
        Ok(entries)
    }

    async fn stale_running(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<RunResultKey>, StoreError> {
        let inner = self.lock()?;
        let mut keys: Vec<RunResultKey> = inner
            .groups
            .values()
            .flat_map(|group| group.run_results.values())
            .filter(|run| run.state == TaskState::Running && run.modified_ts <= cutoff)
            .map(|run| run.key)
            .collect();
        keys.sort_by_key(|key| (key.task_id().raw(), key.try_number()));
        Ok(keys)
    }
}

fn sort_and_trim(
    entries: &mut Vec<(TaskRequest, TaskToRun)>,
    after: Option<(QueueNumber, TaskId)>,
    limit: usize,
) {
    entries.sort_by_key(|(request, to_run)| (to_run.queue_number, request.id));
    if let Some(after) = after {
        entries.retain(|(request, to_run)| {
            to_run
                .queue_number
                .is_some_and(|queue_number| (queue_number, request.id) > after)
        });
    }
    entries.truncate(limit);
}

// =============================================================================
// Clock, events, index fakes
// =============================================================================

/// Mutable clock for driving expirations and ping tolerances in tests.
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        FakeClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().expect("clock mutex poisoned") += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = to;
    }

    pub fn utcnow(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

impl Clock for FakeClock {
    fn utcnow(&self) -> DateTime<Utc> {
        FakeClock::utcnow(self)
    }
}

/// Event sink that remembers everything it saw.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<TaskEvent>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().expect("events mutex poisoned").clone()
    }
}

impl EventSink for RecordingEvents {
    fn record(&self, event: TaskEvent) {
        self.events
            .lock()
            .expect("events mutex poisoned")
            .push(event);
    }
}

/// Search index that records documents and can fail on demand.
#[derive(Default)]
pub struct RecordingIndex {
    documents: Mutex<Vec<TaskDocument>>,
    failures_to_inject: Mutex<u32>,
}

impl RecordingIndex {
    pub fn documents(&self) -> Vec<TaskDocument> {
        self.documents
            .lock()
            .expect("index mutex poisoned")
            .clone()
    }

    pub fn inject_failures(&self, count: u32) {
        *self.failures_to_inject.lock().expect("index mutex poisoned") = count;
    }
}

#[async_trait]
impl SearchIndex for RecordingIndex {
    async fn put(&self, documents: Vec<TaskDocument>) -> anyhow::Result<()> {
        {
            let mut remaining = self.failures_to_inject.lock().expect("index mutex poisoned");
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("index unavailable");
            }
        }
        self.documents
            .lock()
            .expect("index mutex poisoned")
            .extend(documents);
        Ok(())
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// A scheduler wired to fakes, with handles kept for assertions.
pub struct SchedulerFixture {
    pub scheduler: Scheduler,
    pub store: Arc<InMemoryTaskStore>,
    pub clock: Arc<FakeClock>,
    pub events: Arc<RecordingEvents>,
    pub index: Arc<RecordingIndex>,
}

/// Build a scheduler against in-memory fakes for the given environment.
pub fn scheduler_fixture(environment: Environment) -> SchedulerFixture {
    let config = SchedulerConfig::for_environment(environment);
    scheduler_fixture_with_config(config)
}

/// Same as [`scheduler_fixture`], with full control over the tunables.
pub fn scheduler_fixture_with_config(config: SchedulerConfig) -> SchedulerFixture {
    let store = Arc::new(InMemoryTaskStore::new(config.sharding_level));
    let clock = Arc::new(FakeClock::new(
        Utc.timestamp_opt(1_400_000_000, 0).single().expect("valid epoch"),
    ));
    let events = Arc::new(RecordingEvents::default());
    let index = Arc::new(RecordingIndex::default());
    let deps = SchedulerDeps::new(
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&events) as Arc<dyn EventSink>,
        Arc::clone(&index) as Arc<dyn SearchIndex>,
    );
    SchedulerFixture {
        scheduler: Scheduler::new(deps, config),
        store,
        clock,
        events,
        index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NewTask, TaskProperties};
    use crate::store::{transaction, TransactionError, TxnOutcome};

    fn request_at(store_now: DateTime<Utc>) -> TaskRequest {
        NewTask::builder()
            .name("store-unit")
            .user("alice")
            .priority(20)
            .expiration_ts(store_now + chrono::Duration::hours(1))
            .properties(
                TaskProperties::builder()
                    .commands(vec![vec!["true".to_string()]])
                    .build(),
            )
            .build()
            .into_request(
                TaskId::allocate(store_now, &mut rand::thread_rng()),
                store_now,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn commit_checks_the_shard_revision() {
        let store = InMemoryTaskStore::new(5);
        let now = Utc.timestamp_opt(1_400_000_000, 0).unwrap();
        let request = request_at(now);
        let task_id = request.id;
        store.insert_request(request.clone()).await.unwrap();

        let snapshot = store.snapshot(task_id).await.unwrap();
        let to_run = TaskToRun::new(&request, now);
        store
            .commit(
                task_id,
                snapshot.revision,
                vec![TaskEntity::ToRun(to_run.clone())],
            )
            .await
            .unwrap();

        // The old revision is now stale.
        let stale = store
            .commit(task_id, snapshot.revision, vec![TaskEntity::ToRun(to_run)])
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn transaction_retries_through_injected_conflicts() {
        let store = InMemoryTaskStore::new(5);
        let now = Utc.timestamp_opt(1_400_000_000, 0).unwrap();
        let request = request_at(now);
        let task_id = request.id;
        store.insert_request(request.clone()).await.unwrap();

        store.inject_conflicts(2);
        let result = transaction(&store, task_id, 3, |_snapshot| TxnOutcome::Commit {
            value: 42,
            puts: vec![TaskEntity::ToRun(TaskToRun::new(&request, now))],
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn transaction_surfaces_commit_error_when_exhausted() {
        let store = InMemoryTaskStore::new(5);
        let now = Utc.timestamp_opt(1_400_000_000, 0).unwrap();
        let request = request_at(now);
        let task_id = request.id;
        store.insert_request(request.clone()).await.unwrap();

        store.inject_conflicts(10);
        let result = transaction(&store, task_id, 3, |_snapshot| TxnOutcome::Commit {
            value: (),
            puts: vec![TaskEntity::ToRun(TaskToRun::new(&request, now))],
        })
        .await;
        match result {
            Err(TransactionError::Commit(err)) => {
                assert_eq!(err.attempts, 4);
                assert_eq!(err.task_id, task_id);
            }
            other => panic!("expected CommitError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_transactions_never_commit() {
        let store = InMemoryTaskStore::new(5);
        let now = Utc.timestamp_opt(1_400_000_000, 0).unwrap();
        let request = request_at(now);
        let task_id = request.id;
        store.insert_request(request).await.unwrap();
        let before = store.snapshot(task_id).await.unwrap().revision;

        // Even with conflicts queued, a read-only decision returns without
        // touching the store.
        store.inject_conflicts(5);
        let value = transaction(&store, task_id, 0, |snapshot| {
            TxnOutcome::ReadOnly(snapshot.request.is_some())
        })
        .await
        .unwrap();
        assert!(value);
        assert_eq!(store.snapshot(task_id).await.unwrap().revision, before);
    }

    #[tokio::test]
    async fn dedupe_candidate_prefers_the_newest_summary() {
        let store = InMemoryTaskStore::new(5);
        let base = Utc.timestamp_opt(1_400_000_000, 0).unwrap();

        let mut picked = None;
        for offset in [0, 60, 120] {
            let now = base + chrono::Duration::seconds(offset);
            let request = NewTask::builder()
                .name("dedupe-unit")
                .user("alice")
                .priority(20)
                .expiration_ts(now + chrono::Duration::hours(1))
                .properties(
                    TaskProperties::builder()
                        .commands(vec![vec!["true".to_string()]])
                        .idempotent(true)
                        .build(),
                )
                .build()
                .into_request(TaskId::allocate(now, &mut rand::thread_rng()), now)
                .unwrap();
            store.insert_request(request.clone()).await.unwrap();
            let snapshot = store.snapshot(request.id).await.unwrap();
            let mut summary = TaskResultSummary::new(&request, now);
            summary.properties_hash = request.properties_hash.clone();
            store
                .commit(
                    request.id,
                    snapshot.revision,
                    vec![TaskEntity::Summary(summary)],
                )
                .await
                .unwrap();
            picked = Some(request);
        }

        let newest = picked.unwrap();
        let candidate = store
            .dedupe_candidate(newest.properties_hash.as_ref().unwrap())
            .await
            .unwrap()
            .expect("a candidate");
        assert_eq!(candidate.created_ts, newest.created_ts, "newest wins");
    }
}
