//! Task lifecycle events for the statistics pipeline.
//!
//! These are facts about what happened, not commands: the scheduler emits
//! them fire-and-forget through an [`EventSink`] and never depends on the
//! outcome. Sinks must not block and must not fail the caller.

use serde::{Deserialize, Serialize};

use crate::request::Dimensions;

/// Lifecycle events, one per stats entry the scheduler records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    /// A task became live and reapable (or was deduplicated on arrival).
    TaskEnqueued {
        summary_id: String,
        dimensions: Dimensions,
        user: String,
    },

    /// A task reached a successful terminal state.
    TaskCompleted {
        summary_id: String,
        dimensions: Dimensions,
        /// Time from request creation to completion.
        pending_ms: u64,
        user: String,
    },

    /// A task expired before any bot reaped it.
    TaskRequestExpired {
        summary_id: String,
        dimensions: Dimensions,
        user: String,
    },

    /// A bot claimed an attempt.
    RunStarted {
        run_id: String,
        bot_id: String,
        dimensions: Dimensions,
        /// Time the task waited in the queue.
        pending_ms: u64,
        user: String,
    },

    /// A bot streamed a non-terminal update.
    RunUpdated {
        run_id: String,
        bot_id: String,
        dimensions: Dimensions,
    },

    /// A bot reported its final command.
    RunCompleted {
        run_id: String,
        bot_id: String,
        dimensions: Dimensions,
        /// Total command runtime.
        runtime_ms: u64,
        user: String,
    },

    /// An attempt was abandoned because its bot stopped responding or
    /// force-killed the task.
    RunBotDied {
        run_id: String,
        bot_id: String,
        dimensions: Dimensions,
        user: String,
    },
}

/// Fire-and-forget consumer of lifecycle events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: TaskEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn record(&self, _event: TaskEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_serde() {
        let events = vec![
            TaskEvent::TaskEnqueued {
                summary_id: "ab0".to_string(),
                dimensions: Dimensions::new(),
                user: "alice".to_string(),
            },
            TaskEvent::RunStarted {
                run_id: "ab1".to_string(),
                bot_id: "bot-1".to_string(),
                dimensions: Dimensions::new(),
                pending_ms: 1500,
                user: "alice".to_string(),
            },
            TaskEvent::RunBotDied {
                run_id: "ab1".to_string(),
                bot_id: "bot-1".to_string(),
                dimensions: Dimensions::new(),
                user: "alice".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: TaskEvent = serde_json::from_str(&json).unwrap();
        }
    }
}
