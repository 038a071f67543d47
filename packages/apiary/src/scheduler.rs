//! High-level task scheduling operations.
//!
//! This is the interface closest to the RPC handlers: scheduling a request,
//! reaping on behalf of a bot, streaming updates, killing, canceling, and
//! the expire / dead-bot reconciliation primitives the cron loops drive.
//!
//! # Contention discipline
//!
//! - Reap runs its transaction with **zero** retries: a conflict means
//!   another bot won, and the loser simply moves to the next candidate.
//! - Every other mutation retries a bounded number of times and surfaces
//!   [`CommitError`](crate::error::CommitError) when exhausted.
//! - When many bots fight over the head of the queue, every third reap
//!   failure jumps a Gamma-distributed number of entries ahead, spreading
//!   the herd across candidates instead of piling it on one key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use tracing::{debug, error, info};
use typed_builder::TypedBuilder;

use crate::config::SchedulerConfig;
use crate::deps::SchedulerDeps;
use crate::error::{SchedulerError, ValidationError};
use crate::events::TaskEvent;
use crate::index::TaskDocument;
use crate::keys::{ResultSummaryKey, RunResultKey, TaskId, ToRunKey};
use crate::request::{Dimensions, NewTask, TaskRequest};
use crate::result::{TaskResultSummary, TaskRunResult, TaskState};
use crate::store::{transaction, TaskEntity, TransactionError, TxnOutcome};
use crate::to_run::{DispatchQueue, QueueNumber, TaskToRun};

/// Odds that a bot is told to poll again almost immediately instead of
/// backing off. Tunable.
const PROBABILITY_OF_QUICK_COMEBACK: f64 = 0.05;

/// Commit attempts granted to every transaction except reap.
const TRANSACTION_RETRIES: u32 = 3;

/// A bot's progress report for one attempt.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TaskUpdate {
    pub run_result_key: RunResultKey,
    #[builder(setter(into))]
    pub bot_id: String,
    /// Chunk to append to the first command's output stream.
    #[builder(default, setter(strip_option, into))]
    pub output: Option<Vec<u8>>,
    /// Byte offset of `output` within the stream.
    #[builder(default, setter(strip_option))]
    pub output_chunk_start: Option<usize>,
    /// Present exactly when a command finished; paired with `duration`.
    #[builder(default, setter(strip_option))]
    pub exit_code: Option<i32>,
    /// Seconds the completed command took; paired with `exit_code`.
    #[builder(default, setter(strip_option))]
    pub duration: Option<f64>,
    #[builder(default)]
    pub hard_timeout: bool,
    #[builder(default)]
    pub io_timeout: bool,
    /// Cost of the attempt so far.
    #[builder(default, setter(strip_option))]
    pub cost_usd: Option<f64>,
}

/// Outcome of [`Scheduler::bot_update_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateAck {
    /// False when the update was refused or the commit never landed; the
    /// bot must retry the call.
    pub ok: bool,
    pub task_completed: bool,
}

/// Outcome of [`Scheduler::cancel_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub canceled: bool,
    /// Whether the task was already running when cancellation was asked.
    pub was_running: bool,
}

/// The scheduler core. One instance per process; cheap to share behind an
/// `Arc`.
pub struct Scheduler {
    pub(crate) deps: SchedulerDeps,
    pub(crate) config: SchedulerConfig,
    pub(crate) queue: DispatchQueue,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        let queue = DispatchQueue::new(
            Arc::clone(&deps.store),
            config.lookup_cache_ttl,
            config.dispatch_page_size,
        );
        Scheduler {
            deps,
            config,
            queue,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create and store all the entities that make a task live.
    ///
    /// Persists the immutable request first, then commits the result
    /// summary and to-run marker in one group transaction. Idempotent
    /// requests first look for a recent successful run with the same
    /// properties hash and, on a hit, come back already completed with
    /// `deduped_from` set and no dispatchable to-run.
    pub async fn schedule_request(
        &self,
        new_task: NewTask,
    ) -> Result<TaskResultSummary, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let task_id = TaskId::allocate(now, &mut rand::thread_rng());
        let request = new_task.into_request(task_id, now)?;
        let parent_key = request
            .parent_task_id
            .as_deref()
            .map(RunResultKey::unpack)
            .transpose()?;

        self.deps
            .store
            .insert_request(request.clone())
            .await
            .map_err(TransactionError::from_store)?;

        // Kick off the dedupe query before building the entities, so the
        // (eventually consistent) read overlaps the rest of the work.
        let dedupe_future = request.properties_hash.clone().map(|hash| {
            let store = Arc::clone(&self.deps.store);
            async move { store.dedupe_candidate(&hash).await }
        });

        let mut to_run = TaskToRun::new(&request, now);
        let mut summary = TaskResultSummary::new(&request, now);
        let packed = summary.key.pack();

        // Index the task right away so it is searchable even if scheduling
        // fails below; the document would then point at an incomplete task,
        // which every later operation ignores.
        let index_future = self.deps.index.put(vec![TaskDocument {
            name: request.name.clone(),
            packed_id: packed.clone(),
        }]);

        if let Some(future) = dedupe_future {
            let donor = future.await.map_err(TransactionError::from_store)?;
            let oldest = now - chrono::Duration::seconds(self.config.reusable_task_age_secs);
            if let Some(donor) = donor.filter(|donor| donor.created_ts > oldest) {
                // Reuse the donor's results: the new task never becomes
                // dispatchable.
                to_run.queue_number = None;
                let donor_run = donor.key.run_result_key(donor.try_number.max(1));
                let donor_cost = donor.current_cost_usd();
                summary.inherit_result(&donor);
                summary.properties_hash = None;
                summary.try_number = 0;
                summary.cost_saved_usd = Some(donor_cost);
                summary.costs_usd = Vec::new();
                summary.deduped_from = Some(donor_run.pack());
            }
        }

        let store = self.deps.store.as_ref();
        let main_txn = transaction(store, task_id, TRANSACTION_RETRIES, |_snapshot| {
            TxnOutcome::Commit {
                value: (),
                puts: vec![
                    TaskEntity::Summary(summary.clone()),
                    TaskEntity::ToRun(to_run.clone()),
                ],
            }
        });

        let child_id = packed.clone();
        let parent_txn = async {
            let Some(parent) = parent_key else {
                return Ok(true);
            };
            transaction(store, parent.task_id(), TRANSACTION_RETRIES, |snapshot| {
                let (Some(run), Some(parent_summary)) = (
                    snapshot.run_result(parent.try_number()),
                    snapshot.summary.as_ref(),
                ) else {
                    return TxnOutcome::ReadOnly(false);
                };
                let mut run = run.clone();
                let mut parent_summary = parent_summary.clone();
                run.children_task_ids.push(child_id.clone());
                parent_summary.children_task_ids.push(child_id.clone());
                TxnOutcome::Commit {
                    value: true,
                    puts: vec![
                        TaskEntity::RunResult(run),
                        TaskEntity::Summary(parent_summary),
                    ],
                }
            })
            .await
        };

        let (index_result, main_result, parent_result) =
            tokio::join!(index_future, main_txn, parent_txn);
        if let Err(err) = index_result {
            // Best effort only.
            error!(task = %packed, error = %err, "search index put failed");
        }
        main_result?;
        if !parent_result? {
            return Err(ValidationError::UnknownParentTask(
                request.parent_task_id.clone().unwrap_or_default(),
            )
            .into());
        }

        self.deps.events.record(TaskEvent::TaskEnqueued {
            summary_id: packed,
            dimensions: request.properties.dimensions.clone(),
            user: request.user.clone(),
        });
        Ok(summary)
    }

    /// Reap one task matching the bot's dimensions, if any is available.
    ///
    /// Walks the dispatch queue in order, attempting the fail-fast claim on
    /// each candidate. Returns the request and the freshly created run
    /// result of the first claim that commits.
    pub async fn bot_reap_task(
        &self,
        bot_dimensions: &Dimensions,
        bot_id: &str,
        bot_version: &str,
    ) -> Result<Option<(TaskRequest, TaskRunResult)>, SchedulerError> {
        let mut scan = self.queue.next_available(bot_dimensions);
        let mut failures: u32 = 0;
        let mut to_skip: u32 = 0;
        let mut total_skipped: u32 = 0;
        while let Some((request, to_run)) = scan
            .next()
            .await
            .map_err(TransactionError::from_store)?
        {
            if to_skip > 0 {
                to_skip -= 1;
                total_skipped += 1;
                continue;
            }
            let Some(run_result) = self
                .reap_task(&request, to_run.key, bot_id, bot_version)
                .await?
            else {
                failures += 1;
                // Every third failure starting with the very first, jump
                // randomly ahead of the pack instead of fighting hundreds
                // of bots for exactly the same entry.
                if failures % 3 == 1 {
                    to_skip = sample_queue_skip(&mut rand::thread_rng());
                }
                continue;
            };

            debug!(failures, skipped = total_skipped, "reap settled");
            let pending_ms = millis_between(request.created_ts, run_result.started_ts);
            self.deps.events.record(TaskEvent::RunStarted {
                run_id: run_result.key.pack(),
                bot_id: bot_id.to_string(),
                dimensions: request.properties.dimensions.clone(),
                pending_ms,
                user: request.user.clone(),
            });
            return Ok(Some((request, run_result)));
        }
        if failures > 0 {
            info!(failures, skipped = total_skipped, "chose nothing");
        }
        Ok(None)
    }

    /// Transactionally claim one to-run and create its run result.
    ///
    /// Zero commit retries: losing the race is normal, the caller moves on.
    async fn reap_task(
        &self,
        request: &TaskRequest,
        to_run_key: ToRunKey,
        bot_id: &str,
        bot_version: &str,
    ) -> Result<Option<TaskRunResult>, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let server_version = self.config.server_version.clone();
        let result = transaction(
            self.deps.store.as_ref(),
            to_run_key.task_id(),
            0,
            |snapshot| {
                let (Some(to_run), Some(summary)) =
                    (snapshot.to_run.as_ref(), snapshot.summary.as_ref())
                else {
                    return TxnOutcome::ReadOnly(None);
                };
                if !to_run.is_reapable() {
                    return TxnOutcome::ReadOnly(None);
                }
                if summary.bot_id.as_deref() == Some(bot_id) {
                    // This is a retry whose first try failed on this very
                    // bot. Deny it: the bot may be deeply broken and on a
                    // killing spree.
                    return TxnOutcome::ReadOnly(None);
                }
                let mut to_run = to_run.clone();
                let mut summary = summary.clone();
                to_run.queue_number = None;
                let mut run_result = TaskRunResult::new(
                    request,
                    summary.try_number + 1,
                    bot_id,
                    bot_version,
                    now,
                );
                run_result.signal_server_version(&server_version);
                summary.set_from_run_result(&run_result, request);
                TxnOutcome::Commit {
                    value: Some(run_result.clone()),
                    puts: vec![
                        TaskEntity::ToRun(to_run),
                        TaskEntity::RunResult(run_result),
                        TaskEntity::Summary(summary),
                    ],
                }
            },
        )
        .await;

        match result {
            Ok(Some(run_result)) => {
                self.queue.set_lookup_cache(to_run_key, false);
                Ok(Some(run_result))
            }
            Ok(None) => Ok(None),
            // Another bot won the commit; no big deal, reap the next one.
            Err(TransactionError::Commit(_)) => Ok(None),
            Err(TransactionError::Backend(err)) => Err(SchedulerError::Store(err)),
        }
    }

    /// Apply a bot's progress report to the run result and summary.
    ///
    /// Refusals (wrong bot, conflicting exit code, arity mismatch) come
    /// back as `ok = false` with a structured log; a commit that never
    /// landed also returns `ok = false` so the bot retries the call.
    pub async fn bot_update_task(&self, update: TaskUpdate) -> Result<UpdateAck, SchedulerError> {
        if let Some(cost) = update.cost_usd {
            if cost < 0.0 {
                return Err(ValidationError::NegativeCost(cost).into());
            }
        }
        let now = self.deps.clock.utcnow();
        let server_version = self.config.server_version.clone();
        let packed = update.run_result_key.pack();

        enum Decision {
            Refused(String),
            Applied {
                run_result: TaskRunResult,
                request: TaskRequest,
                task_completed: bool,
            },
        }

        let result = transaction(
            self.deps.store.as_ref(),
            update.run_result_key.task_id(),
            TRANSACTION_RETRIES,
            |snapshot| {
                let (Some(request), Some(summary), Some(run)) = (
                    snapshot.request.as_ref(),
                    snapshot.summary.as_ref(),
                    snapshot.run_result(update.run_result_key.try_number()),
                ) else {
                    return TxnOutcome::ReadOnly(Decision::Refused("is missing".to_string()));
                };
                if run.bot_id != update.bot_id {
                    return TxnOutcome::ReadOnly(Decision::Refused(format!(
                        "expected bot ({}) but had update from bot {}",
                        run.bot_id, update.bot_id
                    )));
                }
                if update.duration.is_some() != update.exit_code.is_some() {
                    return TxnOutcome::ReadOnly(Decision::Refused(format!(
                        "had unexpected duration; expected iff a command completes; index {}",
                        run.exit_codes.len()
                    )));
                }

                let mut run = run.clone();
                let command_count = request.properties.commands.len();
                if let (Some(exit_code), Some(duration)) = (update.exit_code, update.duration) {
                    if run.exit_codes.len() == command_count {
                        // Re-delivered report for a command that already has
                        // its code: a retried HTTP call after a 500 whose
                        // write actually landed. Same code is a no-op.
                        if let Some(last) = run.exit_codes.last() {
                            if *last != exit_code {
                                return TxnOutcome::ReadOnly(Decision::Refused(format!(
                                    "got 2 different exit_codes; {last} then {exit_code}"
                                )));
                            }
                        }
                    } else {
                        run.exit_codes.push(exit_code);
                        run.durations.push(duration);
                    }
                }

                let task_completed = run.exit_codes.len() == command_count;
                if run.state.is_running() {
                    if update.hard_timeout || update.io_timeout {
                        run.state = TaskState::TimedOut;
                        run.completed_ts = Some(now);
                    } else if task_completed {
                        run.state = TaskState::Completed;
                        run.completed_ts = Some(now);
                    }
                }
                run.signal_server_version(&server_version);
                if let Some(chunk) = update.output.as_deref() {
                    if let Err(err) =
                        run.append_output(0, chunk, update.output_chunk_start.unwrap_or(0))
                    {
                        return TxnOutcome::ReadOnly(Decision::Refused(err.to_string()));
                    }
                }
                run.cost_usd = update.cost_usd.unwrap_or(0.0).max(run.cost_usd);
                run.modified_ts = now;

                let mut summary = summary.clone();
                if summary.try_number > run.try_number {
                    // A newer try owns the summary: the bot of a superseded
                    // attempt reappeared. Only its cost is reconciled.
                    summary.record_cost(run.try_number, run.cost_usd);
                    summary.modified_ts = now;
                } else {
                    summary.set_from_run_result(&run, request);
                }
                TxnOutcome::Commit {
                    value: Decision::Applied {
                        run_result: run.clone(),
                        request: request.clone(),
                        task_completed,
                    },
                    puts: vec![TaskEntity::RunResult(run), TaskEntity::Summary(summary)],
                }
            },
        )
        .await;

        match result {
            Ok(Decision::Applied {
                run_result,
                request,
                task_completed,
            }) => {
                self.update_stats(&run_result, &request, task_completed);
                Ok(UpdateAck {
                    ok: true,
                    task_completed,
                })
            }
            Ok(Decision::Refused(message)) => {
                error!(task = %packed, "{message}");
                Ok(UpdateAck {
                    ok: false,
                    task_completed: false,
                })
            }
            // The caller must surface this so the bot retries the call.
            Err(TransactionError::Commit(_)) => Ok(UpdateAck {
                ok: false,
                task_completed: false,
            }),
            Err(TransactionError::Backend(err)) => Err(SchedulerError::Store(err)),
        }
    }

    fn update_stats(&self, run_result: &TaskRunResult, request: &TaskRequest, completed: bool) {
        if completed {
            self.deps.events.record(TaskEvent::RunCompleted {
                run_id: run_result.key.pack(),
                bot_id: run_result.bot_id.clone(),
                dimensions: request.properties.dimensions.clone(),
                runtime_ms: (run_result.duration_total() * 1000.0).round() as u64,
                user: request.user.clone(),
            });
            let finished = run_result.completed_ts.unwrap_or(run_result.modified_ts);
            self.deps.events.record(TaskEvent::TaskCompleted {
                summary_id: run_result.key.summary_key().pack(),
                dimensions: request.properties.dimensions.clone(),
                pending_ms: millis_between(request.created_ts, finished),
                user: request.user.clone(),
            });
        } else {
            self.deps.events.record(TaskEvent::RunUpdated {
                run_id: run_result.key.pack(),
                bot_id: run_result.bot_id.clone(),
                dimensions: request.properties.dimensions.clone(),
            });
        }
    }

    /// Force-terminate a running attempt as an internal failure.
    ///
    /// Returns an error message when the kill was refused or could not be
    /// committed; `None` on success.
    pub async fn bot_kill_task(
        &self,
        run_result_key: RunResultKey,
        bot_id: &str,
    ) -> Result<Option<String>, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let server_version = self.config.server_version.clone();
        let packed = run_result_key.pack();

        enum Decision {
            Refused(String),
            Killed {
                run_result: TaskRunResult,
                request: TaskRequest,
            },
        }

        let result = transaction(
            self.deps.store.as_ref(),
            run_result_key.task_id(),
            TRANSACTION_RETRIES,
            |snapshot| {
                let (Some(request), Some(summary), Some(run)) = (
                    snapshot.request.as_ref(),
                    snapshot.summary.as_ref(),
                    snapshot.run_result(run_result_key.try_number()),
                ) else {
                    return TxnOutcome::ReadOnly(Decision::Refused(format!(
                        "Task {packed} is missing"
                    )));
                };
                if run.bot_id != bot_id {
                    return TxnOutcome::ReadOnly(Decision::Refused(format!(
                        "Bot {bot_id} sent task kill for task {packed} owned by bot {}",
                        run.bot_id
                    )));
                }
                if run.state == TaskState::BotDied {
                    return TxnOutcome::ReadOnly(Decision::Refused(format!(
                        "Task {packed} was already killed"
                    )));
                }
                let mut run = run.clone();
                run.signal_server_version(&server_version);
                run.state = TaskState::BotDied;
                run.internal_failure = true;
                run.abandoned_ts = Some(now);
                run.modified_ts = now;
                let mut summary = summary.clone();
                summary.set_from_run_result(&run, request);
                TxnOutcome::Commit {
                    value: Decision::Killed {
                        run_result: run.clone(),
                        request: request.clone(),
                    },
                    puts: vec![TaskEntity::RunResult(run), TaskEntity::Summary(summary)],
                }
            },
        )
        .await;

        match result {
            Ok(Decision::Killed {
                run_result,
                request,
            }) => {
                self.deps.events.record(TaskEvent::RunBotDied {
                    run_id: run_result.key.pack(),
                    bot_id: run_result.bot_id.clone(),
                    dimensions: request.properties.dimensions.clone(),
                    user: request.user.clone(),
                });
                Ok(None)
            }
            Ok(Decision::Refused(message)) => Ok(Some(message)),
            // Cron tags the task BOT_DIED once the ping tolerance passes.
            Err(TransactionError::Commit(err)) => {
                Ok(Some(format!("Failed killing task {packed}: {err}")))
            }
            Err(TransactionError::Backend(err)) => Err(SchedulerError::Store(err)),
        }
    }

    /// Cancel a task that no bot has reaped yet.
    pub async fn cancel_task(
        &self,
        summary_key: ResultSummaryKey,
    ) -> Result<CancelOutcome, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let task_id = summary_key.task_id();
        let outcome = transaction(
            self.deps.store.as_ref(),
            task_id,
            TRANSACTION_RETRIES,
            |snapshot| {
                let (Some(to_run), Some(summary)) =
                    (snapshot.to_run.as_ref(), snapshot.summary.as_ref())
                else {
                    return TxnOutcome::ReadOnly(CancelOutcome {
                        canceled: false,
                        was_running: false,
                    });
                };
                let was_running = summary.state == TaskState::Running;
                if !summary.can_be_canceled() {
                    return TxnOutcome::ReadOnly(CancelOutcome {
                        canceled: false,
                        was_running,
                    });
                }
                let mut to_run = to_run.clone();
                let mut summary = summary.clone();
                to_run.queue_number = None;
                summary.state = TaskState::Canceled;
                summary.abandoned_ts = Some(now);
                summary.modified_ts = now;
                TxnOutcome::Commit {
                    value: CancelOutcome {
                        canceled: true,
                        was_running,
                    },
                    puts: vec![TaskEntity::ToRun(to_run), TaskEntity::Summary(summary)],
                }
            },
        )
        .await
        .map_err(SchedulerError::from)?;

        if outcome.canceled {
            self.queue.set_lookup_cache(task_id.to_run_key(), false);
            info!(task = %summary_key.pack(), "canceled");
        }
        Ok(outcome)
    }

    /// Expire one overdue to-run, unscheduling it and settling the summary.
    ///
    /// Returns `None` when the to-run was no longer reapable at the cheap
    /// pre-check, `Some(true)` on success, `Some(false)` when the
    /// transaction lost out (the next cron run catches it).
    pub(crate) async fn expire_task(
        &self,
        to_run_key: ToRunKey,
    ) -> Result<Option<bool>, SchedulerError> {
        let task_id = to_run_key.task_id();
        // Check reapability once outside the transaction: failing the check
        // here is an order of magnitude cheaper than failing it inside.
        let peek = self
            .deps
            .store
            .snapshot(task_id)
            .await
            .map_err(TransactionError::from_store)?;
        if !peek.to_run.as_ref().is_some_and(TaskToRun::is_reapable) {
            info!(task = %task_id, "not reapable anymore");
            return Ok(None);
        }

        let now = self.deps.clock.utcnow();
        let result = transaction(
            self.deps.store.as_ref(),
            task_id,
            TRANSACTION_RETRIES,
            |snapshot| {
                let (Some(request), Some(to_run), Some(summary)) = (
                    snapshot.request.as_ref(),
                    snapshot.to_run.as_ref(),
                    snapshot.summary.as_ref(),
                ) else {
                    return TxnOutcome::ReadOnly(false);
                };
                if !to_run.is_reapable() {
                    return TxnOutcome::ReadOnly(false);
                }
                let mut to_run = to_run.clone();
                let mut summary = summary.clone();
                to_run.queue_number = None;
                if summary.try_number >= 1 {
                    // A retry is being expired: keep the previous attempt's
                    // observable result instead of reporting Expired.
                    match snapshot.run_result(summary.try_number) {
                        Some(run) => summary.set_from_run_result(run, request),
                        None => summary.state = TaskState::Expired,
                    }
                } else {
                    summary.state = TaskState::Expired;
                }
                summary.abandoned_ts = Some(now);
                summary.modified_ts = now;
                TxnOutcome::Commit {
                    value: true,
                    puts: vec![TaskEntity::ToRun(to_run), TaskEntity::Summary(summary)],
                }
            },
        )
        .await;

        match result {
            Ok(true) => {
                self.queue.set_lookup_cache(to_run_key, false);
                info!(task = %task_id.summary_key().pack(), "expired");
                Ok(Some(true))
            }
            Ok(false) => Ok(Some(false)),
            // The next cron run will retry it.
            Err(TransactionError::Commit(_)) => Ok(Some(false)),
            Err(TransactionError::Backend(err)) => Err(SchedulerError::Store(err)),
        }
    }

    /// Settle a run result whose bot stopped showing signs of life.
    ///
    /// Returns `Some(true)` when the task was retried, `Some(false)` when
    /// it was killed, `None` when nothing needed doing.
    pub(crate) async fn handle_dead_bot(
        &self,
        run_result_key: RunResultKey,
    ) -> Result<Option<bool>, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let server_version = self.config.server_version.clone();
        let packed = run_result_key.pack();
        let task_id = run_result_key.task_id();

        enum Decision {
            Ignored,
            Retried,
            Killed {
                run_result: TaskRunResult,
                request: TaskRequest,
            },
        }

        let result = transaction(
            self.deps.store.as_ref(),
            task_id,
            TRANSACTION_RETRIES,
            |snapshot| {
                let (Some(request), Some(summary), Some(to_run), Some(run)) = (
                    snapshot.request.as_ref(),
                    snapshot.summary.as_ref(),
                    snapshot.to_run.as_ref(),
                    snapshot.run_result(run_result_key.try_number()),
                ) else {
                    return TxnOutcome::ReadOnly(Decision::Ignored);
                };
                if run.state != TaskState::Running {
                    // Updated in the meantime; the stale-index read was
                    // already corrected.
                    return TxnOutcome::ReadOnly(Decision::Ignored);
                }

                let mut run = run.clone();
                run.signal_server_version(&server_version);
                run.state = TaskState::BotDied;
                run.internal_failure = true;
                run.abandoned_ts = Some(now);
                run.modified_ts = now;

                if summary.try_number != run.try_number {
                    // Superseded attempt: close it without touching the
                    // summary the newer try owns.
                    TxnOutcome::Commit {
                        value: Decision::Killed {
                            run_result: run.clone(),
                            request: request.clone(),
                        },
                        puts: vec![TaskEntity::RunResult(run)],
                    }
                } else if summary.try_number == 1 && now < request.expiration_ts {
                    // Retry: requeue with a fresh queue number, reset the
                    // summary, and keep the failure off the summary.
                    let mut to_run = to_run.clone();
                    to_run.queue_number = Some(QueueNumber::generate(request.priority, now));
                    to_run.try_number = 2;
                    let mut summary = summary.clone();
                    summary.reset_to_pending(now);
                    TxnOutcome::Commit {
                        value: Decision::Retried,
                        puts: vec![
                            TaskEntity::RunResult(run),
                            TaskEntity::Summary(summary),
                            TaskEntity::ToRun(to_run),
                        ],
                    }
                } else {
                    // Second try, or expired in the meantime: abandon.
                    let mut summary = summary.clone();
                    summary.set_from_run_result(&run, request);
                    TxnOutcome::Commit {
                        value: Decision::Killed {
                            run_result: run.clone(),
                            request: request.clone(),
                        },
                        puts: vec![TaskEntity::RunResult(run), TaskEntity::Summary(summary)],
                    }
                }
            },
        )
        .await;

        match result {
            Ok(Decision::Retried) => {
                self.queue.set_lookup_cache(task_id.to_run_key(), true);
                info!(task = %packed, "retried");
                Ok(Some(true))
            }
            Ok(Decision::Killed {
                run_result,
                request,
            }) => {
                self.queue.set_lookup_cache(task_id.to_run_key(), false);
                self.deps.events.record(TaskEvent::RunBotDied {
                    run_id: run_result.key.pack(),
                    bot_id: run_result.bot_id.clone(),
                    dimensions: request.properties.dimensions.clone(),
                    user: request.user.clone(),
                });
                Ok(Some(false))
            }
            Ok(Decision::Ignored) | Err(TransactionError::Commit(_)) => {
                info!(task = %packed, "ignored");
                Ok(None)
            }
            Err(TransactionError::Backend(err)) => Err(SchedulerError::Store(err)),
        }
    }

    /// Seconds a bot should wait before polling again.
    pub fn exponential_backoff(&self, attempt_num: u32) -> f64 {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < PROBABILITY_OF_QUICK_COMEBACK {
            // Randomly ask the bot to return quickly.
            return 1.0;
        }
        let capped = attempt_num.min(10) as i32;
        self.config
            .max_backoff_wait()
            .min(1.5_f64.powi(capped + 1))
    }
}

/// How far to jump ahead in the queue after repeated reap failures.
/// Gamma(3, 1) capped at 30; tunable.
fn sample_queue_skip(rng: &mut impl Rng) -> u32 {
    let gamma: Gamma<f64> = Gamma::new(3.0, 1.0).expect("static shape and scale");
    (gamma.sample(rng).round() as u32).min(30)
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn queue_skip_is_bounded() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            assert!(sample_queue_skip(&mut rng) <= 30);
        }
    }

    #[test]
    fn backoff_is_bounded_by_environment() {
        let production = crate::testing::scheduler_fixture(Environment::Production);
        let canary = crate::testing::scheduler_fixture(Environment::Canary);
        for attempt in 0..20 {
            let wait = production.scheduler.exponential_backoff(attempt);
            assert!((1.0..=60.0).contains(&wait), "production {wait}");
            let wait = canary.scheduler.exponential_backoff(attempt);
            assert!((1.0..=3.0).contains(&wait), "canary {wait}");
        }
    }

    #[test]
    fn backoff_grows_until_the_cap() {
        let fixture = crate::testing::scheduler_fixture(Environment::Production);
        // With quick comebacks aside, attempt 0 yields 1.5 and the curve
        // caps at 60; sample enough to see both ends.
        let mut saw_small = false;
        let mut saw_cap = false;
        for _ in 0..200 {
            let wait = fixture.scheduler.exponential_backoff(0);
            saw_small |= (wait - 1.5).abs() < f64::EPSILON || wait == 1.0;
            let wait = fixture.scheduler.exponential_backoff(30);
            saw_cap |= (wait - 60.0).abs() < f64::EPSILON || wait == 1.0;
        }
        assert!(saw_small);
        assert!(saw_cap);
    }

    #[test]
    fn millis_between_clamps_negative_spans() {
        let fixture = crate::testing::scheduler_fixture(Environment::Production);
        let now = fixture.clock.utcnow();
        assert_eq!(millis_between(now, now - chrono::Duration::seconds(1)), 0);
        assert_eq!(
            millis_between(now, now + chrono::Duration::milliseconds(1500)),
            1500
        );
    }
}
