//! Per-attempt run results and the client-visible result summary.
//!
//! State machine:
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    ▲           │    ├──► TimedOut
//!    │           │    ├──► BotDied
//!    │           │    └──► Canceled (kill)
//!    │           └─(bot died on first try, not yet expired)
//!    └───────────────── reset_to_pending
//! Pending ──► Expired / Canceled (never reaped)
//! ```
//!
//! Terminal states are stable: once reached, the only further mutation is
//! idempotent cost reconciliation. The one sanctioned re-entry is the
//! explicit reset to `Pending` when a first attempt's bot died and the task
//! is retried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::keys::{ResultSummaryKey, RunResultKey};
use crate::request::{PropertiesHash, TaskRequest};

/// Lifecycle state shared by run results and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    TimedOut,
    BotDied,
    Expired,
    Canceled,
}

impl TaskState {
    /// Pending and Running are the only non-settled states.
    pub fn is_running(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_running()
    }
}

/// One actual attempt at executing a task on a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub key: RunResultKey,
    pub bot_id: String,
    pub bot_version: String,
    pub try_number: u8,
    pub state: TaskState,
    /// One exit code per completed command, in command order.
    pub exit_codes: Vec<i32>,
    /// Seconds spent per completed command; same cardinality as exit codes.
    pub durations: Vec<f64>,
    /// Appendable output stream per command.
    pub outputs: Vec<Vec<u8>>,
    pub cost_usd: f64,
    pub started_ts: DateTime<Utc>,
    pub completed_ts: Option<DateTime<Utc>>,
    pub abandoned_ts: Option<DateTime<Utc>>,
    /// Set when the scheduler, not the task itself, ended the attempt.
    pub internal_failure: bool,
    /// Last time a bot update touched this record; drives dead-bot
    /// detection.
    pub modified_ts: DateTime<Utc>,
    /// Every server version that mutated this record.
    pub server_versions: Vec<String>,
    /// Packed summary ids of tasks scheduled under this attempt.
    pub children_task_ids: Vec<String>,
}

impl TaskRunResult {
    /// A fresh attempt, already Running: the bot holds the claim from the
    /// moment the reap transaction commits.
    pub fn new(
        request: &TaskRequest,
        try_number: u8,
        bot_id: impl Into<String>,
        bot_version: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        TaskRunResult {
            key: request.id.summary_key().run_result_key(try_number),
            bot_id: bot_id.into(),
            bot_version: bot_version.into(),
            try_number,
            state: TaskState::Running,
            exit_codes: Vec::new(),
            durations: Vec::new(),
            outputs: vec![Vec::new(); request.properties.commands.len()],
            cost_usd: 0.0,
            started_ts: now,
            completed_ts: None,
            abandoned_ts: None,
            internal_failure: false,
            modified_ts: now,
            server_versions: Vec::new(),
            children_task_ids: Vec::new(),
        }
    }

    /// Record which server version touched the entity.
    pub fn signal_server_version(&mut self, server_version: &str) {
        if self.server_versions.last().map(String::as_str) != Some(server_version) {
            self.server_versions.push(server_version.to_string());
        }
    }

    /// Append a chunk to one command's output stream.
    ///
    /// Byte-accurate and retry-safe: re-sending bytes already stored at the
    /// same offset is a no-op, while different bytes at a stored offset are
    /// refused. A chunk starting past the current end zero-fills the gap.
    pub fn append_output(
        &mut self,
        command_index: usize,
        chunk: &[u8],
        offset: usize,
    ) -> Result<(), ValidationError> {
        let stream = self
            .outputs
            .get_mut(command_index)
            .ok_or(ValidationError::CommandIndexOutOfRange(command_index))?;
        let stored = stream.len();
        if offset > stored {
            stream.resize(offset, 0);
        }
        let overlap = stored.saturating_sub(offset).min(chunk.len());
        if overlap > 0 && stream[offset..offset + overlap] != chunk[..overlap] {
            return Err(ValidationError::OutputMismatch { offset });
        }
        if overlap < chunk.len() {
            stream.extend_from_slice(&chunk[overlap..]);
        }
        Ok(())
    }

    /// Total seconds spent across completed commands.
    pub fn duration_total(&self) -> f64 {
        self.durations.iter().sum()
    }
}

/// Client-visible rollup of a task: mirrors the current run result, plus
/// scheduling-level fields that survive across attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultSummary {
    pub key: ResultSummaryKey,
    pub created_ts: DateTime<Utc>,
    pub name: String,
    pub user: String,
    pub state: TaskState,
    /// 0 until a bot reaps the task, then the current attempt number.
    pub try_number: u8,
    pub bot_id: Option<String>,
    pub bot_version: Option<String>,
    pub exit_codes: Vec<i32>,
    pub durations: Vec<f64>,
    pub started_ts: Option<DateTime<Utc>>,
    pub completed_ts: Option<DateTime<Utc>>,
    pub abandoned_ts: Option<DateTime<Utc>>,
    pub internal_failure: bool,
    /// Cost of each attempt, indexed by try number - 1.
    pub costs_usd: Vec<f64>,
    /// Cost avoided by reusing a prior run's result.
    pub cost_saved_usd: Option<f64>,
    /// Packed run-result id whose outcome this summary reuses.
    pub deduped_from: Option<String>,
    /// Advertised only once the task completed successfully, so the dedupe
    /// query matches reusable results and nothing else.
    pub properties_hash: Option<PropertiesHash>,
    /// Packed summary ids of tasks scheduled under this one.
    pub children_task_ids: Vec<String>,
    pub modified_ts: DateTime<Utc>,
}

impl TaskResultSummary {
    pub fn new(request: &TaskRequest, now: DateTime<Utc>) -> Self {
        TaskResultSummary {
            key: request.id.summary_key(),
            created_ts: request.created_ts,
            name: request.name.clone(),
            user: request.user.clone(),
            state: TaskState::Pending,
            try_number: 0,
            bot_id: None,
            bot_version: None,
            exit_codes: Vec::new(),
            durations: Vec::new(),
            started_ts: None,
            completed_ts: None,
            abandoned_ts: None,
            internal_failure: false,
            costs_usd: Vec::new(),
            cost_saved_usd: None,
            deduped_from: None,
            properties_hash: None,
            children_task_ids: Vec::new(),
            modified_ts: now,
        }
    }

    /// Mirror the observable state of a run result into the summary.
    pub fn set_from_run_result(&mut self, run_result: &TaskRunResult, request: &TaskRequest) {
        self.state = run_result.state;
        self.try_number = run_result.try_number;
        self.bot_id = Some(run_result.bot_id.clone());
        self.bot_version = Some(run_result.bot_version.clone());
        self.exit_codes = run_result.exit_codes.clone();
        self.durations = run_result.durations.clone();
        self.started_ts = Some(run_result.started_ts);
        self.completed_ts = run_result.completed_ts;
        self.abandoned_ts = run_result.abandoned_ts;
        self.internal_failure = run_result.internal_failure;
        self.record_cost(run_result.try_number, run_result.cost_usd);
        self.properties_hash = if succeeded(run_result) {
            request.properties_hash.clone()
        } else {
            None
        };
        self.modified_ts = run_result.modified_ts;
    }

    /// Keep `costs_usd[try - 1]` up to date without touching anything else;
    /// used when a stale try reports after a retry superseded it.
    pub fn record_cost(&mut self, try_number: u8, cost_usd: f64) {
        let index = usize::from(try_number.max(1)) - 1;
        if self.costs_usd.len() <= index {
            self.costs_usd.resize(index + 1, 0.0);
        }
        self.costs_usd[index] = cost_usd;
    }

    /// Return the task to the queue for a retry. The previous attempt's
    /// observable result is intentionally not mirrored, and `bot_id` is
    /// retained so the bot that lost the first try cannot reap its own
    /// retry.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.exit_codes.clear();
        self.durations.clear();
        self.started_ts = None;
        self.completed_ts = None;
        self.internal_failure = false;
        self.modified_ts = now;
    }

    /// Only never-reaped tasks can be canceled; running attempts must be
    /// killed by their bot or reconciled by cron.
    pub fn can_be_canceled(&self) -> bool {
        self.state == TaskState::Pending
    }

    /// Copy the observable outcome of a prior task's summary into this one.
    ///
    /// Explicit field list on purpose: identity (`key`, `created_ts`,
    /// `name`, `user`), lineage (`children_task_ids`, `deduped_from`) and
    /// dedupe bookkeeping (`properties_hash`, `costs_usd`, `cost_saved_usd`)
    /// stay untouched and are set by the caller.
    pub fn inherit_result(&mut self, donor: &TaskResultSummary) {
        self.state = donor.state;
        self.try_number = donor.try_number;
        self.bot_id = donor.bot_id.clone();
        self.bot_version = donor.bot_version.clone();
        self.exit_codes = donor.exit_codes.clone();
        self.durations = donor.durations.clone();
        self.started_ts = donor.started_ts;
        self.completed_ts = donor.completed_ts;
        self.abandoned_ts = donor.abandoned_ts;
        self.internal_failure = donor.internal_failure;
    }

    /// Cost of the attempt this summary currently reflects.
    pub fn current_cost_usd(&self) -> f64 {
        self.costs_usd.last().copied().unwrap_or(0.0)
    }
}

fn succeeded(run_result: &TaskRunResult) -> bool {
    run_result.state == TaskState::Completed
        && !run_result.internal_failure
        && run_result.exit_codes.iter().all(|code| *code == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::TaskId;
    use crate::request::{NewTask, TaskProperties};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_400_000_000, 0).unwrap()
    }

    fn request(idempotent: bool) -> TaskRequest {
        NewTask::builder()
            .name("unit")
            .user("alice")
            .priority(50)
            .expiration_ts(now() + chrono::Duration::hours(1))
            .properties(
                TaskProperties::builder()
                    .commands(vec![
                        vec!["echo".to_string(), "a".to_string()],
                        vec!["echo".to_string(), "b".to_string()],
                    ])
                    .idempotent(idempotent)
                    .build(),
            )
            .build()
            .into_request(TaskId::allocate(now(), &mut rand::thread_rng()), now())
            .unwrap()
    }

    #[test]
    fn state_predicates() {
        assert!(TaskState::Pending.is_running());
        assert!(TaskState::Running.is_running());
        for state in [
            TaskState::Completed,
            TaskState::TimedOut,
            TaskState::BotDied,
            TaskState::Expired,
            TaskState::Canceled,
        ] {
            assert!(state.is_terminal(), "{state:?}");
        }
    }

    #[test]
    fn new_run_result_starts_running() {
        let request = request(false);
        let run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        assert_eq!(run.state, TaskState::Running);
        assert_eq!(run.try_number, 1);
        assert_eq!(run.outputs.len(), 2);
        assert_eq!(run.key, request.id.summary_key().run_result_key(1));
    }

    #[test]
    fn append_output_is_idempotent_for_identical_chunks() {
        let request = request(false);
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        run.append_output(0, b"hello ", 0).unwrap();
        run.append_output(0, b"world", 6).unwrap();
        // Retried chunk: exact same bytes at the same offset.
        run.append_output(0, b"world", 6).unwrap();
        assert_eq!(run.outputs[0], b"hello world");
        // Overlapping retry that extends the stream.
        run.append_output(0, b"world!", 6).unwrap();
        assert_eq!(run.outputs[0], b"hello world!");
    }

    #[test]
    fn append_output_refuses_conflicting_bytes() {
        let request = request(false);
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        run.append_output(0, b"hello", 0).unwrap();
        assert_eq!(
            run.append_output(0, b"jello", 0),
            Err(ValidationError::OutputMismatch { offset: 0 })
        );
        assert_eq!(run.outputs[0], b"hello");
    }

    #[test]
    fn append_output_zero_fills_gaps() {
        let request = request(false);
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        run.append_output(1, b"tail", 3).unwrap();
        assert_eq!(run.outputs[1], b"\0\0\0tail");
    }

    #[test]
    fn append_output_checks_command_index() {
        let request = request(false);
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        assert_eq!(
            run.append_output(2, b"x", 0),
            Err(ValidationError::CommandIndexOutOfRange(2))
        );
    }

    #[test]
    fn summary_mirrors_run_result() {
        let request = request(false);
        let mut summary = TaskResultSummary::new(&request, now());
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        run.exit_codes = vec![0, 0];
        run.durations = vec![1.5, 0.5];
        run.state = TaskState::Completed;
        run.completed_ts = Some(now() + chrono::Duration::seconds(2));
        run.cost_usd = 0.25;

        summary.set_from_run_result(&run, &request);
        assert_eq!(summary.state, TaskState::Completed);
        assert_eq!(summary.try_number, 1);
        assert_eq!(summary.bot_id.as_deref(), Some("bot-1"));
        assert_eq!(summary.exit_codes, vec![0, 0]);
        assert_eq!(summary.costs_usd, vec![0.25]);
    }

    #[test]
    fn properties_hash_advertised_only_after_success() {
        let request = request(true);
        let mut summary = TaskResultSummary::new(&request, now());
        assert!(summary.properties_hash.is_none());

        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        summary.set_from_run_result(&run, &request);
        assert!(summary.properties_hash.is_none(), "still running");

        run.state = TaskState::Completed;
        run.exit_codes = vec![0, 1];
        summary.set_from_run_result(&run, &request);
        assert!(summary.properties_hash.is_none(), "non-zero exit code");

        run.exit_codes = vec![0, 0];
        summary.set_from_run_result(&run, &request);
        assert_eq!(summary.properties_hash, request.properties_hash);
    }

    #[test]
    fn reset_to_pending_keeps_bot_id() {
        let request = request(false);
        let mut summary = TaskResultSummary::new(&request, now());
        let mut run = TaskRunResult::new(&request, 1, "bot-1", "v1", now());
        run.state = TaskState::BotDied;
        run.cost_usd = 0.10;
        summary.set_from_run_result(&run, &request);

        summary.reset_to_pending(now() + chrono::Duration::seconds(30));
        assert_eq!(summary.state, TaskState::Pending);
        assert!(summary.exit_codes.is_empty());
        assert_eq!(summary.bot_id.as_deref(), Some("bot-1"));
        assert_eq!(summary.try_number, 1);
        assert_eq!(summary.costs_usd, vec![0.10], "spent cost is kept");
    }

    #[test]
    fn record_cost_grows_the_per_try_ledger() {
        let request = request(false);
        let mut summary = TaskResultSummary::new(&request, now());
        summary.record_cost(2, 0.5);
        assert_eq!(summary.costs_usd, vec![0.0, 0.5]);
        summary.record_cost(1, 0.25);
        assert_eq!(summary.costs_usd, vec![0.25, 0.5]);
    }

    #[test]
    fn only_pending_tasks_can_be_canceled() {
        let request = request(false);
        let mut summary = TaskResultSummary::new(&request, now());
        assert!(summary.can_be_canceled());
        summary.state = TaskState::Running;
        assert!(!summary.can_be_canceled());
        summary.state = TaskState::Completed;
        assert!(!summary.can_be_canceled());
    }
}
