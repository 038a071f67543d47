//! Collaborator capabilities consumed by the scheduler.
//!
//! All external services sit behind small traits so tests can substitute
//! in-memory fakes; the core never embeds a concrete client.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::events::EventSink;
use crate::index::SearchIndex;
use crate::store::TaskStore;

/// Source of the current time, mockable in tests.
pub trait Clock: Send + Sync {
    fn utcnow(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn utcnow(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Dependency container handed to the scheduler at construction.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
    pub index: Arc<dyn SearchIndex>,
}

impl SchedulerDeps {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        SchedulerDeps {
            store,
            clock,
            events,
            index,
        }
    }
}
