//! Reconciliation loops for tasks the normal flow lost track of.
//!
//! Two situations need sweeping:
//! - to-runs nobody reaped before their expiration (not enough bots, a
//!   dimension typo, or an internal failure), and
//! - run results whose bot went silent past the ping tolerance.
//!
//! Both loops are idempotent and safe to run concurrently with bot
//! dispatch; the transaction discipline settles every race. [`start`] wires
//! them onto a cron schedule.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::error::SchedulerError;
use crate::events::TaskEvent;
use crate::scheduler::Scheduler;

/// Tally of one expiration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireTally {
    pub killed: usize,
    pub skipped: usize,
}

/// Tally of one dead-bot sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadBotTally {
    pub retried: usize,
    pub killed: usize,
    pub ignored: usize,
}

impl Scheduler {
    /// Abort every to-run past its expiration that is still queued.
    pub async fn cron_abort_expired_task_to_run(
        &self,
    ) -> Result<ExpireTally, SchedulerError> {
        let now = self.deps.clock.utcnow();
        let mut tally = ExpireTally::default();
        let mut cursor = None;
        loop {
            let page = self
                .queue
                .expired_page(now, cursor)
                .await
                .map_err(crate::store::TransactionError::from_store)?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().and_then(|(request, to_run)| {
                to_run
                    .queue_number
                    .map(|queue_number| (queue_number, request.id))
            });
            for (request, to_run) in page {
                if self.expire_task(to_run.key).await? == Some(true) {
                    tally.killed += 1;
                    self.deps.events.record(TaskEvent::TaskRequestExpired {
                        summary_id: request.id.summary_key().pack(),
                        dimensions: request.properties.dimensions.clone(),
                        user: request.user.clone(),
                    });
                } else {
                    // Not a big deal: either a bot got there first or the
                    // next sweep picks it up.
                    tally.skipped += 1;
                }
            }
            if cursor.is_none() {
                break;
            }
        }
        info!(killed = tally.killed, skipped = tally.skipped, "expired sweep done");
        Ok(tally)
    }

    /// Retry or abandon every Running attempt whose bot has been silent
    /// longer than the ping tolerance.
    pub async fn cron_handle_bot_died(&self) -> Result<DeadBotTally, SchedulerError> {
        let cutoff = self.deps.clock.utcnow()
            - chrono::Duration::seconds(self.config.bot_ping_tolerance_secs);
        let keys = self
            .deps
            .store
            .stale_running(cutoff)
            .await
            .map_err(crate::store::TransactionError::from_store)?;
        let mut tally = DeadBotTally::default();
        for key in keys {
            match self.handle_dead_bot(key).await? {
                Some(true) => tally.retried += 1,
                Some(false) => tally.killed += 1,
                None => tally.ignored += 1,
            }
        }
        info!(
            killed = tally.killed,
            retried = tally.retried,
            ignored = tally.ignored,
            "dead bot sweep done"
        );
        Ok(tally)
    }
}

/// Start both reconciliation sweeps on cron schedules.
///
/// Each tick logs its failure and never aborts the schedule. The returned
/// handle keeps the jobs alive; drop it (or shut it down) to stop them.
pub async fn start(
    scheduler: Arc<Scheduler>,
    expire_schedule: &str,
    dead_bot_schedule: &str,
) -> anyhow::Result<JobScheduler> {
    let jobs = JobScheduler::new().await?;

    let expire_scheduler = Arc::clone(&scheduler);
    let expire_job = Job::new_async(expire_schedule, move |_uuid, _lock| {
        let scheduler = Arc::clone(&expire_scheduler);
        Box::pin(async move {
            if let Err(err) = scheduler.cron_abort_expired_task_to_run().await {
                error!(error = %err, "expired sweep failed");
            }
        })
    })?;
    jobs.add(expire_job).await?;

    let dead_bot_scheduler = Arc::clone(&scheduler);
    let dead_bot_job = Job::new_async(dead_bot_schedule, move |_uuid, _lock| {
        let scheduler = Arc::clone(&dead_bot_scheduler);
        Box::pin(async move {
            if let Err(err) = scheduler.cron_handle_bot_died().await {
                error!(error = %err, "dead bot sweep failed");
            }
        })
    })?;
    jobs.add(dead_bot_job).await?;

    jobs.start().await?;
    info!(
        expire_schedule,
        dead_bot_schedule, "reconciliation sweeps started"
    );
    Ok(jobs)
}
